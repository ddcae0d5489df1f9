//! Disk-backed entry store and version-aware rendered output cache.

pub mod cache;
pub mod config;
pub mod infra;
