//! Core crate for shared genvid types.

pub mod admission;
pub mod config;
pub mod engine;
pub mod executor;
pub mod logging;
pub mod server;
pub mod store;
