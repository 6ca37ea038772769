//! Imposter stub matching and response resolution.
//!
//! # Module Structure
//!
//! - `types` - Response templates, stub definitions, imposter configuration
//! - `request` - Protocol-agnostic request model
//! - `repository` - Ordered stub list with response rotation
//! - `resolver` - Template to response, including the proxy state machine
//! - `proxy` - Proxy transport collaborator
//! - `upcast` - Upgrade of older configuration shapes
//! - `core` - Imposter runtime tying the pieces together

mod core;
mod proxy;
mod repository;
mod request;
mod resolver;
mod types;
mod upcast;

pub use self::core::Imposter;
pub use proxy::{DryRunProxy, HttpProxyTransport, ProxyTransport};
pub use repository::{MatchRecorder, MatchedResponse, StubId, StubRepository};
pub use request::Request;
pub use resolver::{ProxyResolution, Resolution, ResponseResolver};
pub use types::{ImposterConfig, ProxyConfig, ResponseKind, ResponseTemplate, StubDefinition, RESPONSE_TYPES};
pub use upcast::{upcast, upcast_stub};
