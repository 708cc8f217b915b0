//! Error taxonomy for the embedding boundary.
//!
//! Boundary operations never surface these directly: every operation returns a
//! single [`Response`](crate::response::Response), and failures are folded into
//! its `Error` tag at the point where they are detected. `BridgeError` is the
//! internal propagation currency, and the error type of context initialization
//! (the one call that has no response channel yet).

use thiserror::Error;

use crate::handle::HandleId;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// A script-level exception captured from the engine.
    #[error("{0}")]
    EngineException(String),

    /// The operation target did not have the required shape
    /// (not an object, not a function, not an array).
    #[error("{0}")]
    Marshal(&'static str),

    /// A host callback reported failure, or dispatch could not find one.
    #[error("external call failed: {0}")]
    ExternalCall(String),

    /// A handle id that is not, or is no longer, present in the ownership
    /// table. Double release lands here.
    #[error("stale or already released handle: {0:?}")]
    StaleHandle(HandleId),

    /// The execution context has already been disposed.
    #[error("execution context is disposed")]
    Disposed,
}
