//! The SID decode stage: session state machine, unit conversion, the
//! downstream contract and the threaded driver around them.

pub mod convert;
pub mod session;
pub mod sink;
pub mod task;

pub use convert::{AudioFormat, Format, TIME_UNIT};
pub use session::{
    DecodeSession, EngineFactory, GroupIds, Production, SessionContext, SessionState,
};
pub use sink::{Block, BlockSink, Flow, FormatCandidate, StreamEvent, UpstreamEvent};
pub use task::DecodeTask;
