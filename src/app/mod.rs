//! Host-only pieces of `siddec-play`: persistent defaults and outputs.

pub mod output;
pub mod settings;
