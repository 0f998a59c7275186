//! Library surface for the router gateway binary. Split out of `main.rs`
//! so integration tests can drive the Axum app and exercise individual
//! components (`router::route`, the stores, the evaluator/scorer) without
//! spawning the process.

pub mod budget;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod evaluator;
pub mod health;
pub mod metrics;
pub mod provider;
pub mod router;
pub mod scorer;
pub mod session;
pub mod sse;
pub mod task_type;
pub mod types;
