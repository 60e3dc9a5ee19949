//! Bulk population of native property indexes.
//!
//! This crate provides:
//! - The block-based populator: scan workers fill sorted block stores that
//!   are merged and bulk loaded into an index tree
//! - A side log for external updates received while the scan runs
//! - Deferred uniqueness checking through recorded conflicts
//! - A partitioned populator building one part per scan worker
//! - Readers, samplers and progress reporting over the populated index

mod conflict;
pub mod descriptor;
pub mod files;
pub mod partitioned;
pub mod populator;
pub mod progress;
pub mod reader;
pub mod sample;
pub mod scheduler;
pub mod update;
pub mod update_log;

pub use conflict::verify_tree_unique;
pub use descriptor::IndexDescriptor;
pub use files::IndexFiles;
pub use partitioned::{PartitionedPopulator, PartitionedUpdater};
pub use populator::{BlockBasedPopulator, PopulatingUpdater, PopulationState};
pub use progress::{MultiProgressBuilder, PopulationProgress};
pub use reader::{IndexCursor, IndexHit, IndexOrder, IndexQuery, IndexReader, IndexSampler};
pub use sample::{IndexSample, SampleBuilder};
pub use scheduler::{InlineScheduler, Job, RayonScheduler, WorkScheduler};
pub use update::{IndexEntryUpdate, UpdateMode};
