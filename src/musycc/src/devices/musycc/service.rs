// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Service request handshake of a group.
//!
//! A group has one service request register. A request is written, read back until the device
//! latched it, then acknowledged asynchronously by a `ServiceAck` interrupt entry which the
//! bottom half forwards to [`ServiceRequestEngine::complete`]. Only one request per group may be
//! outstanding: [`ServiceRequestEngine::submit`] returns a [`PendingAck`] that keeps the group
//! busy until it is waited on.

use std::sync::atomic::{Ordering, fence};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::descriptor::Direction;
use super::metrics::CardMetrics;
use super::regs::*;
use crate::config::RetryPolicy;
use crate::logger::{IncMetric, debug, extract_guard, warn};

/// Service request operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SrOp {
    /// Does nothing but acknowledge.
    Noop,
    /// Resets a group.
    GroupReset,
    /// Loads the global configuration and the interrupt queue pointers.
    GlobalInit,
    /// Loads a group configuration.
    GroupInit,
    /// Reloads a timeslot map.
    TsmUpdate,
    /// Starts a channel direction.
    ChannelActivate,
    /// Stops a channel direction.
    ChannelDeactivate,
    /// Reloads a channel configuration word.
    ChannelConfig,
    /// Resets the whole chip. Never acknowledged.
    ChipReset,
}

impl SrOp {
    fn code(self) -> u32 {
        match self {
            SrOp::Noop => SR_NOOP,
            SrOp::GroupReset => SR_GROUP_RESET,
            SrOp::GlobalInit => SR_GLOBAL_INIT,
            SrOp::GroupInit => SR_GROUP_INIT,
            SrOp::TsmUpdate => SR_TSM_UPDATE,
            SrOp::ChannelActivate => SR_CHANNEL_ACTIVATE,
            SrOp::ChannelDeactivate => SR_CHANNEL_DEACTIVATE,
            SrOp::ChannelConfig => SR_CHANNEL_CONFIG,
            SrOp::ChipReset => SR_CHIP_RESET,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            SR_NOOP => SrOp::Noop,
            SR_GROUP_RESET => SrOp::GroupReset,
            SR_GLOBAL_INIT => SrOp::GlobalInit,
            SR_GROUP_INIT => SrOp::GroupInit,
            SR_TSM_UPDATE => SrOp::TsmUpdate,
            SR_CHANNEL_ACTIVATE => SrOp::ChannelActivate,
            SR_CHANNEL_DEACTIVATE => SrOp::ChannelDeactivate,
            SR_CHANNEL_CONFIG => SrOp::ChannelConfig,
            SR_CHIP_RESET => SrOp::ChipReset,
            _ => return None,
        })
    }
}

/// A service request word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Operation.
    pub op: SrOp,
    /// Direction, for channel operations and timeslot map updates.
    pub direction: Direction,
    /// Channel inside the group.
    pub gchan: u8,
}

impl ServiceRequest {
    /// The NOOP request.
    pub const NOOP: ServiceRequest = ServiceRequest {
        op: SrOp::Noop,
        direction: Direction::Rx,
        gchan: 0,
    };

    /// Request on channel `gchan`, direction `direction`.
    pub fn new(op: SrOp, direction: Direction, gchan: u8) -> Self {
        ServiceRequest {
            op,
            direction,
            gchan,
        }
    }

    /// Group-wide request.
    pub fn group(op: SrOp) -> Self {
        Self::new(op, Direction::Rx, 0)
    }

    /// Word written to the service request register.
    pub fn to_raw(self) -> u32 {
        self.op.code() | self.direction.sr_bits() | (u32::from(self.gchan) & SR_GCHANNEL_M)
    }

    /// Parses a service request word.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_raw(raw: u32) -> Option<Self> {
        let op = SrOp::from_code(raw & SR_JOB_M)?;
        let direction = if raw & SR_TX_DIRECTION != 0 {
            Direction::Tx
        } else {
            Direction::Rx
        };
        Some(Self::new(op, direction, (raw & SR_GCHANNEL_M) as u8))
    }
}

/// Errors of the service request handshake.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum ServiceRequestError {
    /// Service request {1:#06x} on group {0} did not read back after {2} writes
    Readback(u8, u32, u32),
    /// Service request {1:#06x} on group {0} was not acknowledged in time
    AckTimeout(u8, u32),
}

/// Service request engine of one group.
#[derive(Debug)]
pub struct ServiceRequestEngine {
    group: u8,
    regs: Arc<dyn RegisterBus>,
    policy: RetryPolicy,
    metrics: Arc<CardMetrics>,
    // Last request written. Locked while a request is outstanding.
    gate: Mutex<Option<u32>>,
    // Acknowledgements received and not yet consumed.
    acks: Mutex<u32>,
    ack_cv: Condvar,
}

/// An outstanding service request. The group stays busy until [`PendingAck::wait`] returns.
#[must_use = "the group stays busy until the acknowledgement is waited for"]
#[derive(Debug)]
pub struct PendingAck<'a> {
    engine: &'a ServiceRequestEngine,
    _gate: MutexGuard<'a, Option<u32>>,
    req: u32,
    settle: Option<Duration>,
}

impl PendingAck<'_> {
    /// Request word waiting for its acknowledgement.
    pub fn request(&self) -> u32 {
        self.req
    }

    /// Blocks until the device acknowledged the request. A chip reset sleeps instead.
    pub fn wait(self) -> Result<(), ServiceRequestError> {
        match self.settle {
            Some(settle) => {
                thread::sleep(settle);
                // Nothing acknowledged before the reset is meaningful after it.
                *extract_guard(self.engine.acks.lock()) = 0;
                Ok(())
            }
            None => self.engine.wait_ack(self.req),
        }
    }
}

impl ServiceRequestEngine {
    /// Engine for `group`.
    pub fn new(
        group: u8,
        regs: Arc<dyn RegisterBus>,
        policy: RetryPolicy,
        metrics: Arc<CardMetrics>,
    ) -> Self {
        ServiceRequestEngine {
            group,
            regs,
            policy,
            metrics,
            gate: Mutex::new(None),
            acks: Mutex::new(0),
            ack_cv: Condvar::new(),
        }
    }

    /// Group served by the engine.
    pub fn group(&self) -> u8 {
        self.group
    }

    /// Writes `req` once the group is idle.
    ///
    /// An activation identical to the previous request is preceded by an acknowledged NOOP,
    /// since the device ignores back to back duplicates.
    pub fn submit(&self, req: ServiceRequest) -> Result<PendingAck<'_>, ServiceRequestError> {
        let mut gate = extract_guard(self.gate.lock());
        let raw = req.to_raw();

        if req.op == SrOp::ChannelActivate && *gate == Some(raw) {
            debug!(
                "musycc: group {} repeating activation {raw:#06x}, inserting NOOP",
                self.group
            );
            self.metrics.sr_noop_inserted.inc();
            let noop = ServiceRequest::NOOP.to_raw();
            self.write_latched(noop)?;
            *gate = Some(noop);
            self.wait_ack(noop)?;
        }

        self.write_latched(raw)?;
        *gate = Some(raw);
        self.metrics.service_requests.inc();

        Ok(PendingAck {
            engine: self,
            _gate: gate,
            req: raw,
            settle: (req.op == SrOp::ChipReset).then(|| self.policy.reset_settle()),
        })
    }

    /// Submits `req` and waits for its acknowledgement.
    pub fn serv_req(&self, req: ServiceRequest) -> Result<(), ServiceRequestError> {
        self.submit(req)?.wait()
    }

    /// Records an acknowledgement from the device.
    pub fn complete(&self) {
        let mut acks = extract_guard(self.acks.lock());
        *acks += 1;
        self.ack_cv.notify_all();
    }

    fn write_latched(&self, raw: u32) -> Result<(), ServiceRequestError> {
        let srd = group_reg(self.group, SRD);
        // A reset clears the register, there is nothing to read back.
        let is_reset = raw & SR_JOB_M == SR_CHIP_RESET;
        let mut attempts = 0;
        loop {
            self.regs.write32(srd, raw);
            attempts += 1;
            fence(Ordering::SeqCst);
            if is_reset || self.regs.read32(srd) == raw {
                return Ok(());
            }
            if attempts > self.policy.sr_retries {
                warn!(
                    "musycc: group {} service request {raw:#06x} not latched after {attempts} \
                     writes",
                    self.group
                );
                self.metrics.sr_readback_failures.inc();
                return Err(ServiceRequestError::Readback(self.group, raw, attempts));
            }
            std::hint::spin_loop();
            thread::yield_now();
        }
    }

    fn wait_ack(&self, raw: u32) -> Result<(), ServiceRequestError> {
        let mut acks = extract_guard(self.acks.lock());
        match self.policy.ack_timeout() {
            None => {
                while *acks == 0 {
                    acks = extract_guard(self.ack_cv.wait(acks));
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *acks == 0 {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            "musycc: group {} service request {raw:#06x} not acknowledged",
                            self.group
                        );
                        self.metrics.sr_ack_timeouts.inc();
                        return Err(ServiceRequestError::AckTimeout(self.group, raw));
                    }
                    let (guard, _) = extract_guard(self.ack_cv.wait_timeout(acks, deadline - now));
                    acks = guard;
                }
            }
        }
        *acks -= 1;
        Ok(())
    }
}
