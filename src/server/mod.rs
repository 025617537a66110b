//! HTTP surface for generate, stop and status requests

pub mod http;
pub mod types;

pub use http::{serve, GenerationServer};
pub use types::*;
