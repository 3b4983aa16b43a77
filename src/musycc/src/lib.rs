// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Channel and interrupt engine for MUSYCC multichannel HDLC controllers.
//!
//! The engine moves frames between channel users and the controller through descriptor rings
//! in DMA memory, drains the controller's interrupt queue, allocates per channel FIFO space and
//! timeslots, and restarts channel directions the controller stopped. It reaches the hardware
//! through a [`devices::musycc::regs::RegisterBus`], a [`dma::DmaMemory`] and an interrupt
//! `EventFd`; [`devices::musycc::EmulatedMusycc`] provides all three in software.
#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

/// Card, port and channel configuration.
pub mod config;
/// Hardware seams and the engine itself.
#[allow(missing_docs)]
pub mod devices;
/// DMA memory, its allocator and buffer tokens.
pub mod dma;
/// Logging and metrics.
pub mod logger;
/// Process wide registry of cards.
pub mod registry;

pub use crate::devices::musycc::{
    Card, CardBus, CardError, CardInfo, CardState, ChannelError, ChannelStats, ChannelUser,
    XmitError,
};
pub use crate::registry::{Registry, RegistryError};
