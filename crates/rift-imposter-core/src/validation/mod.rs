//! Static certification of imposter configurations.
//!
//! Structural checks run first: non-empty `responses`, the injection gate
//! and the `_behaviors` schema. A stub that passes them is dry-run through
//! the real matching and resolution code with a synthetic request.

mod dry_run;
mod injection;

pub use dry_run::{AdditionalValidator, DryRunValidator, ValidationResult};
pub use injection::{
    disallowed_injections, disallowed_resolver_injection, has_javascript_injection, has_shell_injection,
};
