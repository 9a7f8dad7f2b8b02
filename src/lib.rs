// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Sense HAT telemetry over AMQP: a self-healing broker session with producer
//! and consumer roles, plus the sampling loop that feeds it.

mod channel;
mod dispatcher;
mod otel;

pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod sensors;
pub mod session;
pub mod topology;
pub mod transport;

pub use otel::{extract_context, HeaderExtractor};
