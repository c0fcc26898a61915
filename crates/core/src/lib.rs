//! Shared domain logic for the atelier orchestration engine.
//!
//! Everything in this crate is backend-agnostic: the error taxonomy,
//! configuration snapshots, the engine output classifier, the model
//! storage layout, the write-once job store and the generic job monitor
//! that races a push channel against a polling probe.

pub mod classifier;
pub mod config;
pub mod error;
pub mod job;
pub mod layout;
pub mod monitor;
pub mod progress;
pub mod types;
