mod dispatch;
mod external;

pub mod context;
pub mod error;
pub mod handle;
pub mod host;
pub mod platform;
pub mod response;

// Core API
pub use context::{ExecutionContext, PropertyAttributes, PropertyFlag};
pub use error::BridgeError;
pub use handle::{HandleId, HandleKind};
pub use host::{DebugChannel, HostEnv};
pub use response::{HandleRef, Response, TransportString, SCRATCH_CAPACITY};
