//! Adapters: concrete implementations of the domain ports.

pub mod cache;
pub mod memory;
pub mod sqlite;
