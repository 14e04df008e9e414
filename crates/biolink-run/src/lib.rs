//! Run engine for BioLink recordings: configuration, the serial event
//! channel, the extension worker, persistence and the session control loop.

pub mod config;
pub mod extension;
pub mod live;
pub mod persist;
pub mod queue;
pub mod serial;
pub mod session;

pub use config::{read_config, RunConfig, SerialConfig};
pub use session::{
    CompletionCallback, ExperimentSession, ForceStopError, SessionHandle, SessionOutcome,
    SessionParts, TerminationCause,
};
