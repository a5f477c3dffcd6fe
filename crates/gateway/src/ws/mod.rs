// WebSocket surface: authenticated upgrade, per-socket task, heartbeat.

pub mod handler;
pub mod protocol;

pub use handler::router;
