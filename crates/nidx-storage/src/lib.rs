//! Storage layer for native property indexes.
//!
//! This crate provides:
//! - Typed index keys with a binary codec whose order matches value order
//! - The key `Layout` contract and its generic implementation
//! - Space-filling curve ordering of spatial values
//! - Block stores with sorted spill files and k-way merging
//! - The paged index tree with bulk loading and range seekers

pub mod block;
mod cancel;
pub mod key;
mod layout;
pub mod spatial;
pub mod tree;

pub use block::{BlockStore, BlockStoreReader, KWayMerge, MergeSource, VecSource};
pub use cancel::Cancellation;
pub use key::{EntityId, Inclusion, IndexKey, KeySlot, Scalar, SlotValue, NO_ENTITY_ID};
pub use layout::{GenericLayout, Layout};
pub use spatial::{SpaceFillingCurve, ZOrderCurve};
pub use tree::{BulkLoader, IndexState, IndexTree, InsertOutcome, SeekOrder, Seeker};
