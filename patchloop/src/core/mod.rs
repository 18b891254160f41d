//! Deterministic, pure logic shared by the iteration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod authenticity;
pub mod classifier;
pub mod command_safety;
pub mod contract;
pub mod decide;
pub mod invariants;
pub mod normalize;
pub mod path;
pub mod request;
pub mod schema;
pub mod stuck;
pub mod types;
