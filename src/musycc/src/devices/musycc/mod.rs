// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Implements the channel and interrupt engine of a MUSYCC multichannel HDLC controller.
//!
//! A card drives up to 8 ports of 32 half duplex channels each. Frames move through descriptor
//! rings in DMA memory, the device reports progress through a shared interrupt queue, and
//! channel level commands go through the per port service request register.

use std::sync::{Mutex, MutexGuard};

use crate::logger::extract_guard;

pub mod card;
pub mod channel;
pub mod descriptor;
pub mod emulation;
pub mod interrupt;
pub mod metrics;
pub mod port;
pub mod regs;
mod restart;
pub mod service;
#[cfg(test)]
pub mod test_utils;
mod watchdog;

pub use self::card::{Card, CardBus, CardError, CardInfo, CardState};
pub use self::channel::{
    ChannelError, ChannelInfo, ChannelState, ChannelStats, ChannelUser, RestartReason, XmitError,
};
pub use self::emulation::{EmulatedFramer, EmulatedMusycc};

pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    extract_guard(mutex.lock())
}
