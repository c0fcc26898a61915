//! ComfyUI integration: REST and WebSocket clients, history parsing,
//! the local engine process supervisor, and the completion probe and
//! push channel used by the job monitor for locally executed jobs.

pub mod api;
pub mod client;
pub mod history;
pub mod messages;
pub mod probe;
pub mod reconnect;
pub mod supervisor;
