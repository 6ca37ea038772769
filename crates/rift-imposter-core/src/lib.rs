//! Mountebank-compatible imposter core.
//!
//! Stub matching, response resolution (including the two-phase proxy
//! protocol), the `_behaviors` post-processing pipeline and dry-run
//! validation of imposter configurations. Protocol listeners and the REST
//! control plane sit on top of this crate and hand it normalized requests.

pub mod behaviors;
pub mod config;
pub mod error;
pub mod imposter;
pub mod logging;
pub mod predicate;
pub mod recording;
pub mod scripting;
pub mod validation;

pub use config::EngineConfig;
pub use error::{ImposterError, Result};
pub use imposter::{
    upcast, DryRunProxy, HttpProxyTransport, Imposter, ImposterConfig, MatchedResponse, ProxyTransport,
    Request, Resolution, ResponseResolver, ResponseTemplate, StubDefinition, StubRepository,
};
pub use logging::ScopedLogger;
pub use predicate::{Encoding, Predicate};
pub use validation::{DryRunValidator, ValidationResult};
