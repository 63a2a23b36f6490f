//! Browser-facing transport.

pub mod websocket;
