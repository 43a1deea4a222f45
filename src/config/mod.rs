//! # cowtree Configuration Module
//!
//! This module centralizes all configuration constants for the engine.
//! Constants are grouped by their functional area and interdependencies are
//! documented and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! The node header size, the root block size and the maximum tree depth all
//! constrain each other and the on-device layout. Co-locating them with
//! compile-time checks prevents a change to one from silently invalidating
//! another.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;
