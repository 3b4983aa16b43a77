// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::mpsc::{Receiver, RecvTimeoutError};

use super::card::CardShared;
use super::channel::ChannelState;
use super::locked;
use crate::devices::framer::Alarms;
use crate::logger::{IncMetric, debug, info};

/// Polls the framers every watchdog interval until told to stop.
pub(crate) fn run(shared: &CardShared, stop: &Receiver<()>) {
    let interval = shared.config.watchdog_interval();
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if shared.running() {
                    shared.check_ports();
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl CardShared {
    /// Polls the alarms of every port and tells the users of its channels when the line
    /// changes state.
    pub(crate) fn check_ports(&self) {
        self.metrics.watchdog_ticks.inc();
        for port in &self.ports {
            let alarms = match self.framer.alarms(port.portnum) {
                Ok(alarms) => alarms,
                Err(err) => {
                    debug!(
                        "musycc: {}: port {} alarms: {err}",
                        self.config.name, port.portnum
                    );
                    continue;
                }
            };
            let up = alarms.line_is_up();
            let changed = {
                let mut state = locked(&port.state);
                let previous = state.alarms.replace(alarms);
                previous.map(Alarms::line_is_up) != Some(up)
            };
            if !changed {
                continue;
            }

            self.metrics.line_transitions.inc();
            info!(
                "musycc: {}: port {} line {} ({alarms:?})",
                self.config.name,
                port.portnum,
                if up { "up" } else { "down" }
            );
            let users: Vec<_> = port
                .channels
                .iter()
                .filter_map(|slot| {
                    let ch = locked(slot);
                    if ch.state == ChannelState::Unassigned {
                        None
                    } else {
                        ch.user.clone()
                    }
                })
                .collect();
            for user in users {
                if up {
                    user.line_is_up();
                } else {
                    user.line_is_down();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::ChannelParams;
    use crate::devices::framer::Alarms;
    use crate::devices::musycc::test_utils::{Fixture, RecordingUser, wait_until};
    use crate::logger::IncMetric;

    #[test]
    fn test_alarm_transitions_notify_users() {
        let fx = Fixture::new();
        let user = RecordingUser::new();
        fx.card.new_chan(1, 9, user.clone()).unwrap();
        fx.card
            .set_chan(9, ChannelParams::with_timeslots(0x1))
            .unwrap();

        fx.framer.set_alarms(1, Alarms::LOS);
        assert!(wait_until(Duration::from_secs(5), || user.line_downs() == 1));
        let ups = user.line_ups();
        fx.framer.set_alarms(1, Alarms::RAI);
        assert!(wait_until(Duration::from_secs(5), || user.line_ups() == ups + 1));
        assert_eq!(user.line_downs(), 1);
        assert!(fx.card.metrics().watchdog_ticks.count() >= 2);
        assert_eq!(fx.card.get_info().ports[1].line_up, Some(true));
    }
}
