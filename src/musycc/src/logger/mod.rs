// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging and metrics for the MUSYCC engine.

mod logging;
mod metrics;

use std::sync::LockResult;

pub use log::{debug, error, info, trace, warn};

pub use crate::logger::logging::{
    DEFAULT_INSTANCE_ID, DEFAULT_LEVEL, INSTANCE_ID, LOGGER, Logger, LoggerConfig, LoggerInitError,
    LoggerUpdateError, parse_level,
};
pub use crate::logger::metrics::{
    DriverMetrics, IncMetric, LoggerSystemMetrics, METRICS, Metrics, MetricsError,
    SharedIncMetric,
};

/// Returns the guard of a lock even when a previous holder panicked.
pub(crate) fn extract_guard<G>(lock_result: LockResult<G>) -> G {
    match lock_result {
        Ok(guard) => guard,
        // At worst a counter or a log line is left half updated.
        Err(poisoned) => poisoned.into_inner(),
    }
}
