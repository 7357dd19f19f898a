//! Site Management
//!
//! Loads a site directory (site.toml plus device files) from disk.

mod config;
mod loader;

pub use config::*;
pub use loader::*;
