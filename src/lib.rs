//! Vackup: back up, restore, clone and transfer Docker volumes.
//!
//! The `core` module drives the docker CLI through disposable helper
//! containers; `server` exposes it over a local HTTP API.

pub mod core;
pub mod server;
pub mod utils;

pub use crate::core::{VolumeError, VolumeService};
pub use crate::utils::AppConfig;
