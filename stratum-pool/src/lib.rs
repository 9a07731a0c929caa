//! Stratum v1 mining pool server.
//!
//! One listener and template poller per configured coin, a share evaluation
//! engine with vardiff, and a durable telemetry pipeline, driven by the
//! `stratum-poold` daemon and inspected through its HTTP API.

pub mod api;
pub mod api_client;
pub mod coin;
pub mod config;
pub mod daemon;
pub mod error;
pub mod job;
pub mod pow;
pub mod registry;
pub mod rpc;
pub mod service;
pub mod share;
pub mod stats;
pub mod stratum;
pub mod telemetry;
pub mod tracing;
pub mod types;
pub mod vardiff;
