//! Hearth core library — domain types, configuration, registry, errors.
//!
//! Public API surface:
//! - [`types`] — channel identities, server records, lifecycle commands
//! - [`config`] — [`Config`] built once at startup
//! - [`paths`] — on-disk layout under the hearth root
//! - [`registry`] — record persistence, liveness self-heal, start lock
//! - [`process`] — pid probes and signals
//! - [`error`] — [`RegistryError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod paths;
pub mod process;
pub mod registry;
pub mod types;

pub use config::{CompilerConfig, Config, Timeouts};
pub use error::{ConfigError, RegistryError};
pub use registry::LockToken;
pub use types::{ChannelIdentity, Command, LivenessState, Role, ServerRecord, Targets};
