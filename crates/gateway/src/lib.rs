//! Gateway side of the ferrule client.
//!
//! A [`Session`] connects to the gateway URL advertised by the REST API,
//! identifies (or resumes), keeps the connection alive with heartbeats and
//! forwards dispatch events to an [`EventSink`]. Connection tasks run under
//! a [`Manager`]; when they stop, the session either reconnects or reports
//! why it could not.

pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod session;
pub mod sink;

pub use {
    error::{Error, Result},
    manager::{Manager, Signal},
    session::{Session, SessionState},
    sink::{Discard, EventSink},
};
