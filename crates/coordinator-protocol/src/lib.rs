//! Shared wire and configuration types for the coordinator: the FID/action
//! key vocabulary, the JSON request/reply schema, and the on-disk/env
//! configuration layer. No scheduling logic lives here — see
//! `coordinator-engine` for that.

pub mod action;
pub mod config;
pub mod error;
pub mod fid;
pub mod wire;

pub use action::{ActionKey, ActionKind, WireAction};
pub use config::{CoordinatorConfig, HostMappingRule};
pub use error::{ConfigError, ProtocolError};
pub use fid::Fid;
