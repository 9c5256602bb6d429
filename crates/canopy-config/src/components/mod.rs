//! Per-component configuration
//!
//! Small, focused settings for the components that actually need them.

pub mod cache;
pub mod consumer;
pub mod engine;
pub mod store;

pub use cache::*;
pub use consumer::*;
pub use engine::*;
pub use store::*;
