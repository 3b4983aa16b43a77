// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Seam to the per-port line framer.

use std::fmt::Debug;

use bitflags::bitflags;

use crate::config::{LoopbackMode, PortParams};

bitflags! {
    /// Line alarms reported by a framer.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Alarms: u8 {
        /// Loss of signal.
        const LOS = 1;
        /// Out of frame.
        const OOF = 1 << 1;
        /// Alarm indication signal, all ones received.
        const AIS = 1 << 2;
        /// Remote alarm indication.
        const RAI = 1 << 3;
    }
}

impl Alarms {
    /// Whether the line carries frames.
    pub fn line_is_up(self) -> bool {
        !self.intersects(Alarms::LOS | Alarms::OOF | Alarms::AIS)
    }
}

/// Errors reported by a framer.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum FramerError {
    /// Port {0} has no framer
    NoFramer(u8),
    /// Framer register {0:#x} does not exist
    BadRegister(u16),
    /// Framer access failed: {0}
    Access(String),
}

/// Line framer of every port of a card.
pub trait Framer: Send + Sync + Debug {
    /// Programs the framer of `port` for `params`.
    fn init_comet(&self, port: u8, params: &PortParams) -> Result<(), FramerError>;
    /// Current alarms of `port`.
    fn alarms(&self, port: u8) -> Result<Alarms, FramerError>;
    /// Sets the loopback of `port`.
    fn set_loopback(&self, port: u8, mode: LoopbackMode) -> Result<(), FramerError>;
    /// Reads framer register `reg` of `port`.
    fn read_reg(&self, port: u8, reg: u16) -> Result<u8, FramerError>;
    /// Writes framer register `reg` of `port`.
    fn write_reg(&self, port: u8, reg: u16, value: u8) -> Result<(), FramerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_state() {
        assert!(Alarms::empty().line_is_up());
        assert!(Alarms::RAI.line_is_up());
        assert!(!Alarms::LOS.line_is_up());
        assert!(!(Alarms::OOF | Alarms::RAI).line_is_up());
        assert!(!Alarms::AIS.line_is_up());
    }
}
