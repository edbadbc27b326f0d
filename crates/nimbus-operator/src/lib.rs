//! Job-queue worker and sandbox wiring for the nimbus controller
//!
//! The binary in `main.rs` parses [`config::Config`], builds a
//! [`sandbox::Sandbox`] and runs the [`worker::JobWorker`] next to the
//! reconciler until interrupted.

pub mod config;
pub mod sandbox;
pub mod worker;

pub use config::Config;
pub use sandbox::Sandbox;
pub use worker::{JobWorker, WorkerConfig};
