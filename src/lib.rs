//! Commodore 64 SID tune decoder.
//!
//! A [`DecodeSession`] buffers a PSID/RSID image, runs it on an emulated
//! C64 ([`engine::ResidEngine`]) and produces raw PCM blocks for a
//! [`BlockSink`]. [`DecodeTask`] drives a session from a worker thread.

pub mod bus;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod roms;
pub mod tune;

pub use config::{SessionConfig, Setting};
pub use decoder::{BlockSink, DecodeSession, DecodeTask};
pub use error::{ConfigError, SessionError};
