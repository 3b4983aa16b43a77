// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use crate::config::CardConfig;
use crate::devices::musycc::{Card, CardBus, CardError, CardInfo};
use crate::logger::{
    INSTANCE_ID, LOGGER, LoggerConfig, LoggerUpdateError, METRICS, MetricsError, debug, info,
};

/// Errors of the card registry.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum RegistryError {
    /// A card named {0} is already registered
    DuplicateName(String),
    /// No card named {0}
    NoSuchCard(String),
    /// Card error: {0}
    Card(#[from] CardError),
    /// Logger error: {0}
    Logger(#[from] LoggerUpdateError),
    /// Metrics error: {0}
    Metrics(#[from] MetricsError),
}

impl RegistryError {
    /// Positive errno value matching the error.
    pub fn errno(&self) -> i32 {
        match self {
            RegistryError::DuplicateName(_) => libc::EEXIST,
            RegistryError::NoSuchCard(_) => libc::ENXIO,
            RegistryError::Card(err) => err.errno(),
            RegistryError::Logger(_) | RegistryError::Metrics(_) => libc::EIO,
        }
    }
}

/// Owns the cards of the process, keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    cards: BTreeMap<String, Card>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds, initializes and registers a card.
    pub fn add(&mut self, config: CardConfig, bus: CardBus) -> Result<&Card, RegistryError> {
        if self.cards.contains_key(&config.name) {
            return Err(RegistryError::DuplicateName(config.name));
        }
        let name = config.name.clone();
        let card = Card::new(config, bus)?;
        card.init()?;
        info!("musycc: registered card {name}");
        Ok(self.cards.entry(name).or_insert(card))
    }

    /// Card named `name`.
    pub fn get(&self, name: &str) -> Result<&Card, RegistryError> {
        self.cards
            .get(name)
            .ok_or_else(|| RegistryError::NoSuchCard(name.to_string()))
    }

    /// Shuts down and forgets card `name`.
    pub fn remove(&mut self, name: &str) -> Result<(), RegistryError> {
        let card = self
            .cards
            .remove(name)
            .ok_or_else(|| RegistryError::NoSuchCard(name.to_string()))?;
        card.shutdown();
        info!("musycc: removed card {name}");
        Ok(())
    }

    /// Names of the registered cards, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cards.keys().map(String::as_str)
    }

    /// Summary of every card.
    pub fn info(&self) -> Vec<CardInfo> {
        self.cards.values().map(Card::get_info).collect()
    }

    /// Installs the process logger, tags its lines with `instance` and applies `config`.
    ///
    /// The tag is set once per process, later calls keep the first one.
    pub fn configure_logger(instance: &str, config: LoggerConfig) -> Result<(), RegistryError> {
        if INSTANCE_ID.set(instance.to_string()).is_err() {
            debug!("musycc: log tag already set");
        }
        if LOGGER.init().is_err() {
            debug!("musycc: a logger is already installed");
        }
        LOGGER.update(config)?;
        Ok(())
    }

    /// Flushes the process metrics to `sink`, which is only taken on the first call.
    pub fn write_metrics(
        &self,
        sink: impl std::io::Write + Send + 'static,
    ) -> Result<bool, RegistryError> {
        if METRICS.init(sink).is_ok() {
            debug!("musycc: metrics sink set");
        }
        Ok(METRICS.write()?)
    }

    /// Shuts down every card.
    pub fn shutdown_all(&mut self) {
        for card in self.cards.values() {
            card.shutdown();
        }
        self.cards.clear();
    }
}
