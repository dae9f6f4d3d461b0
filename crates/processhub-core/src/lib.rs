//! ProcessHub Core
//!
//! Core types for the ProcessHub distributed process manager.
//!
//! # Overview
//!
//! This crate provides:
//! - Validated hub/child identifiers and child specs
//! - The worker hot-swap protocol and a helper worker runtime
//! - Explicit limits and the crate-wide error type
//! - I/O abstractions (time, randomness) for deterministic tests

pub mod child;
pub mod constants;
pub mod error;
pub mod io;
pub mod telemetry;
pub mod worker;

pub use child::{ChildId, ChildSpec, HubId, Pid};
pub use constants::*;
pub use error::{Error, Result};
pub use io::{IoContext, MockClock, RngProvider, StdRng, TimeProvider, WallClock};
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use worker::{spawn_worker, HubWorker, RedundancyMode, WorkerHandle, WorkerMsg};
