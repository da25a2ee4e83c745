//! `VoiceChat` SFU
//!
//! Selective forwarding media server: workers host routers, routers forward
//! RTP from producers to consumers, and a WebSocket signaling layer drives
//! rooms and 1:1 mesh calls.

pub mod api;
pub mod config;
pub mod engine;
pub mod voice;
pub mod ws;
