//! Cache layer of the Canopy file-tree metadata core
//!
//! The relational store is authoritative; this crate keeps derived
//! projections fast to read and eventually consistent with it.
//!
//! ## Architecture
//!
//! - [`repository::CachedFileRepository`]: cache-aside reads with negative
//!   caching and single-flight miss collapsing; synchronous invalidation of
//!   the mutated entity after commit
//! - [`bus::EventBus`]: publishes [`canopy_core::InvalidationEvent`]s to streams
//! - [`consumer::StreamConsumer`]: consumer-group workers that repair listing
//!   and recycle-bin projections
//! - [`service::FileService`]: the facade wiring engine, repository, bus and
//!   deletion queue together
//!
//! The cache itself sits behind [`backend::CacheBackend`], with Redis
//! semantics; [`memory::MemoryCache`] implements it in process.

pub mod backend;
pub mod bus;
pub mod codec;
pub mod consumer;
pub mod error;
pub mod keys;
pub mod logging;
pub mod memory;
pub mod repository;
pub mod service;
pub mod single_flight;

pub use backend::{CacheBackend, CacheOp, StreamId, StreamMessage};
pub use bus::EventBus;
pub use consumer::{ConsumerState, PathRenameHandler, StreamConsumer, StreamHandler, UpdateHandler};
pub use error::{CacheError, CacheResult};
pub use memory::MemoryCache;
pub use repository::CachedFileRepository;
pub use service::{FileService, ServiceError, ServiceResult};
