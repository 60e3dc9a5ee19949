//! Buffer management for index population.
//!
//! This crate provides the `BufferArena`, which hands out exclusively owned
//! byte buffers, tracks the bytes in use, and optionally pools released
//! buffers for reuse.

mod arena;

pub use arena::{ArenaStats, BufferArena, ScopedBuffer};
