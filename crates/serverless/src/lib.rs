//! Client for a RunPod-style serverless queueing API.
//!
//! Jobs are queued with `POST /{endpoint}/run` and polled with
//! `GET /{endpoint}/status/{id}`; there is no push channel.

pub mod client;
pub mod output;
pub mod probe;
pub mod status;
