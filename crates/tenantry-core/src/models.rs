//! Domain models for Tenantry.
//!
//! These are the core types shared across all crates.

pub mod budget;
pub mod connectivity;
pub mod document;
pub mod tenant;
pub mod usage;
