//! Paged B+ tree holding the populated index.
//!
//! ```text
//! page 0: header (magic, format version, state, root, counts, failure message)
//! page 1..: nodes, node n on page n + 1
//!
//!              [internal: sep_0 | sep_1 ...]
//!              /           |            \
//!   [leaf] <-> [leaf] <-> [leaf] <-> [leaf]     (doubly linked for descending seeks)
//! ```
//!
//! Separators are minimal splitters of the neighbouring leaf keys, so
//! internal pages stay small even for long text keys.

mod bulk;
mod file;
mod header;
mod index;
mod node;
mod seek;

pub use bulk::{BuiltTree, BulkLoader, BULK_FILL_FACTOR};
pub use header::{truncate_utf8, IndexHeader, IndexState, INDEX_MAGIC, MAX_FAILURE_MESSAGE};
pub use index::{IndexTree, InsertOutcome};
pub use seek::{SeekOrder, Seeker, SEEK_BATCH_SIZE};
