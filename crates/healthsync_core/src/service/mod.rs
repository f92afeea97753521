//! Use-case services over the shared store.
//!
//! # Responsibility
//! - `mutation_service`: the primary process's only write path.
//! - `accessor`: owner-scoped, memory-aware reads for any process.

pub mod accessor;
pub mod mutation_service;
