//! Error types shared by the decoder, the configuration layer and the host.

use thiserror::Error;

use crate::decoder::session::SessionState;

/// Failures of a decode session.
///
/// Every variant except `InvalidState` and `Config` is terminal for the
/// session that produced it: the session moves to `Failed` (or `Ended` for consumer
/// rejections) and the error is posted once on the message bus.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Accumulated input would exceed the tune image bound.
    #[error("input data bigger than allowed buffer size ({len} > {max} bytes)")]
    Overflow { len: usize, max: usize },

    /// The image could not be parsed, or the sub-tune index is out of range.
    #[error("could not select song: {0}")]
    TuneSelection(String),

    /// The engine rejected the tune.
    #[error("could not load tune: {0}")]
    Load(String),

    /// No output format acceptable to both sides.
    #[error("could not negotiate format: {0}")]
    Negotiation(String),

    /// The sound-chip backend reported an unusable state.
    #[error("could not create builder: {0}")]
    Builder(String),

    /// The downstream consumer refused a block.
    #[error("downstream rejected block ({})", rejection_kind(.fatal))]
    ConsumerRejected { fatal: bool },

    /// The operation is not valid in the session's current state.
    #[error("operation not valid in state {0:?}")]
    InvalidState(SessionState),

    /// The worker thread producing blocks could not be started.
    #[error("could not start stream thread: {0}")]
    Spawn(String),

    /// A setting was rejected; the previous value stays in place.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Whether this error is surfaced to the user as a fatal message.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::ConsumerRejected { fatal } => *fatal,
            SessionError::InvalidState(_) | SessionError::Config(_) => false,
            _ => true,
        }
    }
}

fn rejection_kind(fatal: &bool) -> &'static str {
    if *fatal {
        "fatal error"
    } else {
        "not linked"
    }
}

/// A unit conversion with no defined mapping (or a zero rate/width).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot convert {from:?} to {to:?}")]
pub struct ConversionUnsupported {
    pub from: crate::decoder::convert::Format,
    pub to: crate::decoder::convert::Format,
}

/// Rejected configuration assignment.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown setting `{0}`")]
    UnknownKey(String),

    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },

    #[error("`{key}` out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        key: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("expected key=value, got `{0}`")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SessionError::Overflow { len: 2, max: 1 }.is_fatal());
        assert!(SessionError::Builder("x".into()).is_fatal());
        assert!(SessionError::ConsumerRejected { fatal: true }.is_fatal());
        assert!(!SessionError::ConsumerRejected { fatal: false }.is_fatal());
        assert!(!SessionError::InvalidState(SessionState::Ended).is_fatal());
        assert!(!SessionError::from(ConfigError::UnknownKey("x".into())).is_fatal());
    }

    #[test]
    fn messages_name_the_failure() {
        let e = SessionError::Overflow { len: 40000, max: 32768 };
        assert_eq!(
            e.to_string(),
            "input data bigger than allowed buffer size (40000 > 32768 bytes)"
        );
        let e = SessionError::ConsumerRejected { fatal: false };
        assert_eq!(e.to_string(), "downstream rejected block (not linked)");
    }
}
