//! Subcommands.

pub mod clear;
pub mod enqueue;
pub mod migrate;
pub mod stats;
pub mod work;
