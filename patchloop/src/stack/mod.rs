//! Stack resolution: which language, toolchain and test command a repository uses.

pub mod bootstrap;
pub mod catalog;
pub mod markers;
pub mod plugins;
pub mod resolve;
pub mod spec;
