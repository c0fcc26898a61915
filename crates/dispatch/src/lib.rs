//! Uniform submit / poll / fetch contract over the three backend kinds.
//!
//! The [`Dispatcher`](dispatcher::Dispatcher) picks a backend from a fresh
//! configuration snapshot on every submission, registers the job in its
//! [`JobStore`](atelier_core::job::JobStore) and hands the backend's
//! correlation handle to a tracked monitor task.

pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod local;
pub mod remote;
pub mod request;
pub mod serverless;
