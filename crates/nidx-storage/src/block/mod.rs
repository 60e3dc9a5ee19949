//! External sorting: block stores, block cursors and k-way merging.
//!
//! ```text
//! add → [pending keys] --sort--> block 0 | block 1 | ... (one file per store)
//!                                   \        |        /
//!                         BlockReader  BlockReader  BlockReader
//!                                    \       |       /
//!                                       KWayMerge → ascending keys
//! ```

mod merge;
mod reader;
mod store;

pub use merge::{KWayMerge, MergeSource, VecSource};
pub use reader::{BlockReader, BlockStoreReader};
pub use store::BlockStore;
