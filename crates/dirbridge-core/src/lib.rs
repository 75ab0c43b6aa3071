//! # dirbridge-core
//!
//! Core types shared by the dirbridge directory integration crates.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy for connect, bind, search and provisioning failures
//! - [`config`] - Layered key/value configuration sources

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{ConfigSource, LayeredSource, MapSource, PrefixedSource};
pub use error::{BindError, ConnectError, Error, ProvisionFailure, Result};
