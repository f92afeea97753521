//! Process health: memory budget and store diagnostics.

pub mod memory;
pub mod monitor;
