//! dsm Common Library
//!
//! Shared constants, configuration loading and the process supervisor
//! contract used by every crate of the dsm workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - Magic number, directory keys, queue size, limits
//! - [`config`] - Configuration loading traits and types
//! - [`supervisor`] - Worker process supervisor contract
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use dsm_common::consts::*;
//! use dsm_common::config::{ConfigLoader, DsmConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
pub mod supervisor;
