//! Proxy recording and match history.
//!
//! Supports three modes:
//! - `proxyOnce`: Record first response, replay on subsequent matches
//! - `proxyAlways`: Always proxy, record all responses
//! - `proxyTransparent`: Always proxy, never record
//!
//! # Module Structure
//!
//! - `mode` - Proxy recording mode enum
//! - `store` - Request/match history storage collaborator
//! - `stub_generator` - Predicates and responses for recorded stubs

mod mode;
mod store;
mod stub_generator;

pub use mode::ProxyMode;
pub use store::{in_memory_factory, InMemoryRequestStore, RequestStore, StoreFactory};
pub use stub_generator::{predicates_for, recorded_response, PROXY_RESPONSE_TIME};
