//! CLI command implementations.

pub mod headless;
pub mod menu;
