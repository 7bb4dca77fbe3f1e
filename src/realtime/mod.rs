// src/realtime/mod.rs
pub mod client;
pub mod hub;

pub use client::{ClientSession, SessionConfig, SessionEnd};
pub use hub::{ClientConnection, Hub, HubHandle, HubStats};
