// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Emulated and real hardware seams of the engine.

pub mod framer;
pub mod musycc;
