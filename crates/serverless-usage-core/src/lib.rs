// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod cloud;
pub mod config;
pub mod cycle;
pub mod derived;
pub mod error;
pub mod executor;
pub mod influxdb;
pub mod joiner;
pub mod normalizer;
pub mod platforms;
pub mod probe;
pub mod prometheus;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod table;
