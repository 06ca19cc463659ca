//! User-visible notifications from a decode session to the host.

use crossbeam_channel::{Receiver, Sender};

use crate::decoder::session::SessionState;
use crate::error::SessionError;
use crate::tune::TuneMetadata;

#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// A fatal session error. Posted at most once per session.
    Error(SessionError),
    Eos,
    Tags(TuneMetadata),
    StreamStart { stream_id: String, group_id: u32 },
    StateChanged { from: SessionState, to: SessionState },
}

pub type BusSender = Sender<BusMessage>;
pub type BusReceiver = Receiver<BusMessage>;

/// Unbounded: the session must never block on a slow host.
pub fn channel() -> (BusSender, BusReceiver) {
    crossbeam_channel::unbounded()
}
