// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reactivates channel directions the device stopped on a buffer condition.
//!
//! The bottom half cannot wait for a service request acknowledgement, since it is the one
//! delivering it. It records why a direction stopped and queues a [`RestartWork`]; the worker
//! thread issues the activation.
//!
//! The worker holds the channel's restart lock from the generation check until its service
//! requests complete, so a concurrent `chan_down` either sees the activation done or makes the
//! work stale before it is checked.

use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;

use super::card::CardShared;
use super::channel::ChannelState;
use super::descriptor::Direction;
use super::locked;
use super::port::Port;
use super::regs::THP;
use super::service::{ServiceRequest, SrOp};
use crate::logger::{IncMetric, debug, error};

/// Restart request for one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RestartWork {
    pub port: u8,
    pub gchan: u8,
    /// Channel generation when the work was queued. Work from an older generation is stale.
    pub generation: u64,
}

/// Worker loop, returns once every sender is gone.
pub(crate) fn run(shared: &CardShared, queue: &Receiver<RestartWork>) {
    while let Ok(work) = queue.recv() {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        shared.wq_chan_restart(work);
    }
}

impl CardShared {
    pub(crate) fn wq_chan_restart(&self, work: RestartWork) {
        let Some(port) = self.ports.get(usize::from(work.port)) else {
            return;
        };
        let (Some(slot), Some(restart)) = (
            port.channels.get(usize::from(work.gchan)),
            port.restarts.get(usize::from(work.gchan)),
        ) else {
            return;
        };
        // `chan_down` waits for this before it deactivates and frees the rings.
        let _restart = locked(restart);

        let (start_rx, start_tx) = {
            let mut ch = locked(slot);
            if ch.generation != work.generation || ch.state != ChannelState::Up {
                debug!(
                    "musycc: {}: stale restart for port {} channel {}",
                    self.config.name, work.port, work.gchan
                );
                return;
            }
            ch.restart_queued = false;
            let start_rx = ch.ch_start_rx.is_some() && ch.params.rx_enabled;
            if start_rx {
                ch.ch_start_rx = None;
            }
            (start_rx, ch.ch_start_tx.is_some() && ch.params.tx_enabled)
        };

        let mut performed = false;
        if start_rx {
            performed |= self.issue(
                port,
                ServiceRequest::new(SrOp::ChannelActivate, Direction::Rx, work.gchan),
            );
        }
        if start_tx && self.update_tx_thp(port, work) {
            performed |= self.issue(
                port,
                ServiceRequest::new(SrOp::ChannelActivate, Direction::Tx, work.gchan),
            );
        }
        if performed {
            self.metrics.restarts_performed.inc();
        }
    }

    /// Reclaims sent descriptors and points THP at the next one the device should send.
    ///
    /// Returns whether that descriptor holds a frame the device owns, in which case the TX
    /// restart flag is cleared. Otherwise the flag stays set for the next `start_xmit`.
    fn update_tx_thp(&self, port: &Port, work: RestartWork) -> bool {
        let (ready, wake, full, user) = {
            let mut state = locked(&port.state);
            let mut ch = locked(&port.channels[usize::from(work.gchan)]);
            if ch.generation != work.generation || ch.state != ChannelState::Up {
                return false;
            }
            // A device owned head is the frame to restart on, there is no write-back to wait for.
            let wake = match ch.reclaim_tx(0, &self.tx_pending) {
                Ok(reclaim) => reclaim.wake,
                Err(err) => {
                    self.metrics.dma_errors.inc();
                    error!("musycc: {}: TX reclaim: {err}", self.config.name);
                    return false;
                }
            };
            let thp = ch.tx_resume_addr();
            port.write_chan_reg(&mut state, THP, work.gchan, thp);

            let ready = ch.tx_ready_to_restart().unwrap_or(false);
            if ready {
                ch.ch_start_tx = None;
            } else {
                debug!(
                    "musycc: {}: port {} channel {} TX restart deferred, nothing to send",
                    self.config.name, work.port, work.gchan
                );
            }
            let full = ch.tx.as_ref().is_some_and(|tx| tx.full);
            (ready, wake, full, ch.user.clone())
        };

        if let Some(user) = user {
            if wake || (!full && user.queue_stopped()) {
                user.enable_xmit();
            }
        }
        ready
    }
}
