// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Vmbus channel implementations using async.

#![forbid(unsafe_code)]

mod core;
pub mod queue;
pub mod signal;
