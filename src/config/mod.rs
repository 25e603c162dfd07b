//! # Configuration Module
//!
//! Centralizes layout constants and the open-mode bit set. Constants live
//! in [`constants`] with their interdependencies documented in one place;
//! [`mode`] defines the flags that select single-process, multi-process
//! or shared-memory-backed operation.

pub mod constants;
pub mod mode;

pub use constants::*;
pub use mode::OpenMode;
