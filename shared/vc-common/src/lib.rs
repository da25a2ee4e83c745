//! `VoiceChat` Common Library
//!
//! Shared types, the signaling protocol and the ORTC media stack used by
//! both the SFU server and the session client.

pub mod error;
pub mod ortc;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
