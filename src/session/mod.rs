//! Generation session coordination
//!
//! Leaves first: the state store, stream handles, the registry that keeps
//! at most one handle per resource, and the coordinator that runs the
//! preempt / reserve / start protocol.

pub mod coordinator;
pub mod error;
pub mod handle;
pub mod registry;
pub mod state;

pub use coordinator::{CoordinatorConfig, GenerateRequest, GenerationCoordinator};
pub use error::CoordinatorError;
pub use handle::{HandleOptions, ResponseStream, StreamHandle};
pub use registry::{InMemoryStreamRegistry, StreamRegistry};
pub use state::{SessionState, SessionStateStore, StatusView};
