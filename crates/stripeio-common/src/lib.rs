//! stripeio Common - Shared types and utilities
//!
//! This crate provides the typed identifiers and checksum helpers used
//! across stripeio components.

pub mod checksum;
pub mod types;

pub use types::*;
