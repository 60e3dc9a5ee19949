//! Block-based index population.
//!
//! ```text
//! scan workers ──add──▶ [BlockStore per worker] ──sort/spill──▶ .scan-N files
//!                                  │ scan_completed
//!                                  ▼
//!                  merge passes (parallel, one job per store)
//!                                  │
//!                                  ▼
//!              k-way merge ──▶ BulkLoader ──▶ IndexTree (.idx)
//!                                  │
//! updater ──process──▶ UpdateLog (.ext) ──replay──▶ IndexTree
//!                                  │
//!                                  ▼
//!                 recorded conflicts (.idx.dup) re-checked
//! ```
//!
//! Until the scanned entries are in the tree, external updates go to the
//! side log and are replayed once, in arrival order. Afterwards an updater
//! writes straight into the tree.

use crate::conflict::{verify_tree_unique, RecordingConflictDetector};
use crate::descriptor::IndexDescriptor;
use crate::files::IndexFiles;
use crate::progress::PopulationProgress;
use crate::reader::IndexReader;
use crate::sample::{IndexSample, SampleBuilder};
use crate::scheduler::{Job, WorkScheduler};
use crate::update::{IndexEntryUpdate, UpdateMode};
use crate::update_log::{UpdateLog, UpdateRecord};
use nidx_buffer::BufferArena;
use nidx_common::{run_all, IndexError, PopulationConfig, Result, Value, MAX_ENTRY_SIZE};
use nidx_storage::tree::{truncate_utf8, MAX_FAILURE_MESSAGE};
use nidx_storage::{
    BlockStore, BulkLoader, Cancellation, EntityId, GenericLayout, IndexKey, IndexState,
    IndexTree, KWayMerge, Layout,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Scanned entries merged between cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Failure message used when none was given.
const DEFAULT_FAILURE: &str = "index population failed";

/// Lifecycle of a population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulationState {
    Creating,
    Scanning,
    Merging,
    Online,
    Failed,
}

impl std::fmt::Display for PopulationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PopulationState::Creating => "CREATING",
            PopulationState::Scanning => "SCANNING",
            PopulationState::Merging => "MERGING",
            PopulationState::Online => "ONLINE",
            PopulationState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

struct Lifecycle {
    state: PopulationState,
    closed: bool,
    dropped: bool,
    failure: Option<String>,
}

#[derive(Default)]
struct PopulationStats {
    scanned: AtomicU64,
    stores_to_merge: AtomicU64,
    stores_merged: AtomicU64,
    build_started: AtomicBool,
    scan_entries: AtomicU64,
    applied_scan: AtomicU64,
    external_logged: AtomicU64,
    applied_external: AtomicU64,
    updates_since_sample: AtomicU64,
}

/// Populates one index from a scan plus concurrent external updates.
///
/// Scan workers call `add` with their own worker id. Each worker fills a
/// separate block store, so workers never contend on the same buffer.
pub struct BlockBasedPopulator {
    descriptor: IndexDescriptor,
    layout: Arc<GenericLayout>,
    files: IndexFiles,
    config: PopulationConfig,
    arena: Arc<BufferArena>,
    cancellation: Cancellation,
    lifecycle: Mutex<Lifecycle>,
    scan_stores: RwLock<BTreeMap<usize, Mutex<BlockStore<GenericLayout>>>>,
    external: Mutex<Option<UpdateLog<GenericLayout>>>,
    tree: RwLock<Option<Arc<IndexTree<GenericLayout>>>>,
    /// Held for the whole of `scan_completed`; closing waits on it.
    merge_lock: Mutex<()>,
    updater_open: AtomicBool,
    stats: PopulationStats,
    sample: Mutex<Option<IndexSample>>,
}

impl BlockBasedPopulator {
    /// Creates a populator. Nothing touches the disk before `create`.
    pub fn new(
        descriptor: IndexDescriptor,
        layout: Arc<GenericLayout>,
        files: IndexFiles,
        config: PopulationConfig,
        arena: Arc<BufferArena>,
    ) -> Result<Self> {
        descriptor.validate()?;
        config.validate()?;
        if layout.slot_count() != descriptor.slot_count {
            return Err(IndexError::ConfigError(format!(
                "layout has {} slots but index '{}' covers {} properties",
                layout.slot_count(),
                descriptor.name,
                descriptor.slot_count
            )));
        }
        Ok(Self {
            descriptor,
            layout,
            files,
            config,
            arena,
            cancellation: Cancellation::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: PopulationState::Creating,
                closed: false,
                dropped: false,
                failure: None,
            }),
            scan_stores: RwLock::new(BTreeMap::new()),
            external: Mutex::new(None),
            tree: RwLock::new(None),
            merge_lock: Mutex::new(()),
            updater_open: AtomicBool::new(false),
            stats: PopulationStats::default(),
            sample: Mutex::new(None),
        })
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    pub fn layout(&self) -> &Arc<GenericLayout> {
        &self.layout
    }

    pub fn files(&self) -> &IndexFiles {
        &self.files
    }

    pub fn state(&self) -> PopulationState {
        self.lifecycle.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.lock().closed
    }

    pub fn failure_message(&self) -> Option<String> {
        self.lifecycle.lock().failure.clone()
    }

    pub(crate) fn tree(&self) -> Result<Arc<IndexTree<GenericLayout>>> {
        self.tree
            .read()
            .clone()
            .ok_or_else(|| IndexError::invalid_state("index tree has not been created"))
    }

    fn check_scanning(&self, operation: &str) -> Result<()> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.closed {
            return Err(IndexError::invalid_state(format!(
                "{} on a closed populator",
                operation
            )));
        }
        if lifecycle.state != PopulationState::Scanning {
            return Err(IndexError::invalid_state(format!(
                "{} called in state {}",
                operation, lifecycle.state
            )));
        }
        Ok(())
    }

    fn check_online(&self, operation: &str) -> Result<()> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.dropped || lifecycle.state != PopulationState::Online {
            return Err(IndexError::invalid_state(format!(
                "{} requires an online index, state is {}",
                operation, lifecycle.state
            )));
        }
        Ok(())
    }

    /// Creates the index file and clears leftovers of earlier attempts.
    pub fn create(&self) -> Result<()> {
        {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return Err(IndexError::invalid_state("create on a closed populator"));
            }
            if lifecycle.state != PopulationState::Creating {
                return Err(IndexError::invalid_state(format!(
                    "create called in state {}",
                    lifecycle.state
                )));
            }
        }

        self.files.clear()?;
        let tree = IndexTree::create(
            Arc::clone(&self.layout),
            &self.files.store_file(),
            self.config.fsync_enabled,
        )?;
        *self.tree.write() = Some(Arc::new(tree));
        *self.external.lock() = Some(UpdateLog::new(
            Arc::clone(&self.layout),
            self.files.external_updates_file(),
            self.config.fsync_enabled,
        ));

        self.lifecycle.lock().state = PopulationState::Scanning;
        info!(
            index = %self.descriptor.name,
            unique = self.descriptor.unique,
            path = %self.files.store_file().display(),
            "index population started"
        );
        Ok(())
    }

    fn check_size(&self, key: &IndexKey) -> Result<()> {
        let size = self.layout.key_size(key);
        if size > MAX_ENTRY_SIZE {
            return Err(IndexError::OversizedEntry {
                size,
                max: MAX_ENTRY_SIZE,
            });
        }
        Ok(())
    }

    fn new_scan_store(&self, worker: usize) -> BlockStore<GenericLayout> {
        BlockStore::new(
            Arc::clone(&self.layout),
            Arc::clone(&self.arena),
            self.files.scan_file(worker),
            &self.config,
        )
    }

    fn with_scan_store<T>(
        &self,
        worker: usize,
        f: impl FnOnce(&mut BlockStore<GenericLayout>) -> Result<T>,
    ) -> Result<T> {
        {
            let stores = self.scan_stores.read();
            if let Some(store) = stores.get(&worker) {
                let mut store = store.lock();
                return f(&mut *store);
            }
        }
        let mut stores = self.scan_stores.write();
        let store = stores
            .entry(worker)
            .or_insert_with(|| Mutex::new(self.new_scan_store(worker)));
        f(store.get_mut())
    }

    /// Adds a batch of scanned entries on behalf of scan worker `worker`.
    ///
    /// Every update must be an addition. Uniqueness is not checked here;
    /// duplicates are found when the scan is merged.
    pub fn add(&self, worker: usize, updates: &[IndexEntryUpdate]) -> Result<()> {
        self.check_scanning("add")?;
        let mut key = self.layout.new_key();
        self.with_scan_store(worker, |store| {
            for update in updates {
                let IndexEntryUpdate::Added { entity_id, values } = update else {
                    return Err(IndexError::InvalidArgument(format!(
                        "scan entries must be additions, got {}",
                        update
                    )));
                };
                self.layout.encode(*entity_id, values, &mut key)?;
                self.check_size(&key)?;
                store.add(&key)?;
                self.stats.scanned.fetch_add(1, AtomicOrdering::Relaxed);
            }
            Ok(())
        })
    }

    /// Adds already encoded entries, as produced by another index tree.
    pub(crate) fn add_keys<'k>(
        &self,
        worker: usize,
        keys: impl IntoIterator<Item = &'k IndexKey>,
    ) -> Result<()> {
        self.check_scanning("add")?;
        self.with_scan_store(worker, |store| {
            for key in keys {
                store.add(key)?;
                self.stats.scanned.fetch_add(1, AtomicOrdering::Relaxed);
            }
            Ok(())
        })
    }

    /// Scanned entries are sampled while they are merged, so nothing needs
    /// to be collected per update.
    pub fn include_sample(&self, _update: &IndexEntryUpdate) {}

    /// Opens the updater for external changes. Only one may be open at a time.
    pub fn new_populating_updater(&self) -> Result<PopulatingUpdater<'_>> {
        {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return Err(IndexError::invalid_state(
                    "populating updater requested from a closed populator",
                ));
            }
            match lifecycle.state {
                PopulationState::Creating => {
                    return Err(IndexError::invalid_state(
                        "populating updater requested before create",
                    ))
                }
                PopulationState::Failed => {
                    return Err(IndexError::invalid_state(
                        "populating updater requested from a failed population",
                    ))
                }
                _ => {}
            }
        }
        if self
            .updater_open
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return Err(IndexError::invalid_state(
                "another populating updater is already open",
            ));
        }
        Ok(PopulatingUpdater {
            populator: self,
            closed: false,
        })
    }

    /// Encodes an update. `None` when it cannot touch the index: a removal
    /// of a value too large to ever have been added.
    fn encode_update(&self, update: &IndexEntryUpdate) -> Result<Option<UpdateRecord<IndexKey>>> {
        let layout = &self.layout;
        match update {
            IndexEntryUpdate::Added { entity_id, values } => {
                let key = layout.key_of(*entity_id, values)?;
                self.check_size(&key)?;
                Ok(Some(UpdateRecord::added(key)))
            }
            IndexEntryUpdate::Changed {
                entity_id,
                before,
                after,
            } => {
                let after = layout.key_of(*entity_id, after)?;
                self.check_size(&after)?;
                Ok(Some(match self.storable_key(*entity_id, before)? {
                    Some(before) => UpdateRecord::changed(before, after),
                    None => UpdateRecord::added(after),
                }))
            }
            IndexEntryUpdate::Removed { entity_id, values } => Ok(self
                .storable_key(*entity_id, values)?
                .map(UpdateRecord::removed)),
        }
    }

    /// Key for `values`, or `None` if it exceeds the entry size limit.
    fn storable_key(&self, entity_id: EntityId, values: &[Value]) -> Result<Option<IndexKey>> {
        match self.layout.key_of(entity_id, values) {
            Ok(key) if self.layout.key_size(&key) <= MAX_ENTRY_SIZE => Ok(Some(key)),
            Ok(_) | Err(IndexError::OversizedEntry { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn process_update(&self, update: &IndexEntryUpdate) -> Result<()> {
        let record = self.encode_update(update)?;
        let mut external = self.external.lock();
        let state = {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return Err(IndexError::invalid_state(
                    "update processed after the populator was closed",
                ));
            }
            lifecycle.state
        };
        if let Some(log) = external.as_mut().filter(|log| !log.is_done_adding()) {
            if let Some(record) = &record {
                log.add(record)?;
                self.stats.external_logged.fetch_add(1, AtomicOrdering::Relaxed);
            }
            return Ok(());
        }
        // A sealed log during MERGING means the replay already finished.
        if !matches!(state, PopulationState::Online | PopulationState::Merging) {
            return Err(IndexError::invalid_state(format!(
                "update processed in state {}",
                state
            )));
        }
        let Some(record) = record else {
            return Ok(());
        };
        let tree = self.tree()?;
        self.apply_online(&tree, &record)?;
        self.stats
            .updates_since_sample
            .fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn apply_online(
        &self,
        tree: &IndexTree<GenericLayout>,
        record: &UpdateRecord<IndexKey>,
    ) -> Result<()> {
        match (record.mode, &record.key2) {
            (UpdateMode::Added, _) => self.insert_checked(tree, &record.key),
            (UpdateMode::Removed, _) => tree.remove(&record.key).map(|_| ()),
            (UpdateMode::Changed, Some(after)) => {
                let removed = tree.remove(&record.key)?;
                let result = self.insert_checked(tree, after);
                if result.is_err() && removed {
                    tree.insert(&record.key)?;
                }
                result
            }
            (UpdateMode::Changed, None) => Err(IndexError::Internal(
                "changed update without a new value".to_string(),
            )),
        }
    }

    /// Inserts into the online tree, rejecting a value already held by
    /// another entity of a unique index.
    fn insert_checked(&self, tree: &IndexTree<GenericLayout>, key: &IndexKey) -> Result<()> {
        let outcome = tree.insert(key)?;
        if !self.descriptor.unique || outcome.value_equal_neighbor.is_none() {
            return Ok(());
        }
        let layout = &self.layout;
        let existing = tree.value_entries(key).into_iter().find(|other| {
            layout.entity_id(other) != layout.entity_id(key) && layout.exact_value_eq(other, key)
        });
        match existing {
            Some(existing) => {
                if outcome.inserted {
                    tree.remove(key)?;
                }
                Err(IndexError::Conflict {
                    existing: layout.entity_id(&existing),
                    added: layout.entity_id(key),
                    value: layout.describe_value(key),
                })
            }
            None => Ok(()),
        }
    }

    /// Merges the scanned entries into the tree and replays external updates.
    ///
    /// Must be called once, after every scan worker finished adding. On
    /// success the population is online and the tree is flushed with state
    /// POPULATING. Any fault marks the population as failed.
    pub fn scan_completed(&self, scheduler: &dyn WorkScheduler) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                debug!(index = %self.descriptor.name, "populator closed before merge, skipping");
                return Ok(());
            }
            if lifecycle.state != PopulationState::Scanning {
                return Err(IndexError::invalid_state(format!(
                    "scan_completed called in state {}",
                    lifecycle.state
                )));
            }
            lifecycle.state = PopulationState::Merging;
        }

        let _merging = self.merge_lock.lock();
        let started = Instant::now();
        let result = self.merge_scan_and_build(scheduler);

        let mut lifecycle = self.lifecycle.lock();
        match result {
            Ok(()) => {
                if lifecycle.state == PopulationState::Merging {
                    lifecycle.state = PopulationState::Online;
                }
                info!(
                    index = %self.descriptor.name,
                    scanned = self.stats.applied_scan.load(AtomicOrdering::Relaxed),
                    external = self.stats.applied_external.load(AtomicOrdering::Relaxed),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    state = %lifecycle.state,
                    "index population merged"
                );
                Ok(())
            }
            Err(e) => {
                lifecycle.state = PopulationState::Failed;
                if lifecycle.failure.is_none() {
                    lifecycle.failure = Some(e.to_string());
                }
                warn!(index = %self.descriptor.name, error = %e, "index population failed");
                Err(e)
            }
        }
    }

    fn merge_scan_and_build(&self, scheduler: &dyn WorkScheduler) -> Result<()> {
        let mut stores: Vec<BlockStore<GenericLayout>> = std::mem::take(&mut *self.scan_stores.write())
            .into_values()
            .map(Mutex::into_inner)
            .collect();
        let result = self.build_from_stores(&mut stores, scheduler);
        let closed = run_all(
            stores.iter_mut().map(|store| move || store.close()),
            |e| warn!(error = %e, "failed to close scan store"),
        );
        result.and(closed)
    }

    fn build_from_stores(
        &self,
        stores: &mut [BlockStore<GenericLayout>],
        scheduler: &dyn WorkScheduler,
    ) -> Result<()> {
        self.merge_stores(stores, scheduler)?;

        // Updates arriving from here on wait until the replay is done.
        let mut external = self.external.lock();
        let log = external
            .as_mut()
            .ok_or_else(|| IndexError::invalid_state("external update log is gone"))?;
        log.done_adding()?;
        self.cancellation.check()?;

        let tree = self.tree()?;
        self.stats.build_started.store(true, AtomicOrdering::Release);
        let mut detector = RecordingConflictDetector::new(
            Arc::clone(&self.layout),
            self.descriptor.unique,
            Arc::clone(&self.arena),
            self.files.duplicates_file(),
            &self.config,
        );
        let result = self.write_all_to_tree(&tree, stores, log, &mut detector);
        let closed = detector.close();
        result.and(closed)?;

        // Flushed but still POPULATING; close(true) flips it online.
        tree.checkpoint()
    }

    fn merge_stores(
        &self,
        stores: &mut [BlockStore<GenericLayout>],
        scheduler: &dyn WorkScheduler,
    ) -> Result<()> {
        for store in stores.iter_mut() {
            store.done_adding()?;
        }
        let entries: u64 = stores.iter().map(|s| s.entry_count()).sum();
        self.stats.scan_entries.store(entries, AtomicOrdering::Relaxed);
        self.stats
            .stores_to_merge
            .store(stores.len() as u64, AtomicOrdering::Relaxed);

        let merge_factor = self.config.merge_factor;
        let cancel = &self.cancellation;
        let merged = &self.stats.stores_merged;
        let jobs: Vec<Job<'_>> = stores
            .iter_mut()
            .map(|store| {
                Box::new(move || {
                    store.merge(merge_factor, cancel)?;
                    merged.fetch_add(1, AtomicOrdering::Relaxed);
                    Ok(())
                }) as Job<'_>
            })
            .collect();
        scheduler.run_all(
            &format!("block merging for '{}'", self.descriptor.name),
            jobs,
        )
    }

    fn write_all_to_tree(
        &self,
        tree: &IndexTree<GenericLayout>,
        stores: &[BlockStore<GenericLayout>],
        log: &UpdateLog<GenericLayout>,
        detector: &mut RecordingConflictDetector<GenericLayout>,
    ) -> Result<()> {
        let sample = self.write_scan_updates(tree, stores, detector)?;
        self.write_external_updates(tree, log, detector)?;
        detector.verify(tree, &self.cancellation)?;
        *self.sample.lock() = sample;
        Ok(())
    }

    /// Streams the merged scan entries into a bulk-loaded tree, recording
    /// neighbours that share a value.
    fn write_scan_updates(
        &self,
        tree: &IndexTree<GenericLayout>,
        stores: &[BlockStore<GenericLayout>],
        detector: &mut RecordingConflictDetector<GenericLayout>,
    ) -> Result<Option<IndexSample>> {
        let layout = Arc::clone(&self.layout);
        let readers = stores
            .iter()
            .map(BlockStore::reader)
            .collect::<Result<Vec<_>>>()?;
        let mut merge = KWayMerge::new(Arc::clone(&layout), readers);
        let mut loader = BulkLoader::new(Arc::clone(&layout));
        let mut sampler = SampleBuilder::<GenericLayout>::new();
        let mut key = layout.new_key();
        let mut previous: Option<IndexKey> = None;
        let mut written = 0u64;

        while merge.next_deduped(&mut key)? {
            if written % CANCEL_CHECK_INTERVAL == 0 {
                self.cancellation.check()?;
            }
            match &mut previous {
                Some(prev) => {
                    detector.check(prev, &key)?;
                    prev.clone_from(&key);
                }
                None => previous = Some(key.clone()),
            }
            sampler.include(&layout, &key);
            loader.push(&key)?;
            written += 1;
            self.stats.applied_scan.fetch_add(1, AtomicOrdering::Relaxed);
        }

        // Duplicates from overlapping stores were dropped by the merge.
        self.stats.scan_entries.store(written, AtomicOrdering::Relaxed);
        let built = loader.finish();
        debug!(
            index = %self.descriptor.name,
            entries = built.entry_count(),
            height = built.height(),
            "bulk loaded scanned entries"
        );
        tree.install(built)?;
        Ok((!self.descriptor.unique).then(|| sampler.build()))
    }

    /// Replays the external update log in arrival order.
    fn write_external_updates(
        &self,
        tree: &IndexTree<GenericLayout>,
        log: &UpdateLog<GenericLayout>,
        detector: &mut RecordingConflictDetector<GenericLayout>,
    ) -> Result<()> {
        let mut reader = log.reader()?;
        while let Some(record) = reader.next_record()? {
            self.cancellation.check()?;
            match (record.mode, &record.key2) {
                (UpdateMode::Added, _) => Self::write_recording(tree, detector, &record.key)?,
                (UpdateMode::Removed, _) => {
                    tree.remove(&record.key)?;
                }
                (UpdateMode::Changed, Some(after)) => {
                    tree.remove(&record.key)?;
                    Self::write_recording(tree, detector, after)?;
                }
                (UpdateMode::Changed, None) => {
                    return Err(IndexError::Corrupted(
                        "changed update without a new value".to_string(),
                    ))
                }
            }
            self.stats
                .applied_external
                .fetch_add(1, AtomicOrdering::Relaxed);
            self.stats
                .updates_since_sample
                .fetch_add(1, AtomicOrdering::Relaxed);
        }
        debug!(
            index = %self.descriptor.name,
            applied = self.stats.applied_external.load(AtomicOrdering::Relaxed),
            recorded_conflicts = detector.recorded_count(),
            "external updates applied"
        );
        Ok(())
    }

    fn write_recording(
        tree: &IndexTree<GenericLayout>,
        detector: &mut RecordingConflictDetector<GenericLayout>,
        key: &IndexKey,
    ) -> Result<()> {
        let outcome = tree.insert(key)?;
        if let Some(neighbor) = &outcome.value_equal_neighbor {
            detector.check(neighbor, key)?;
        }
        Ok(())
    }

    /// Sample of the populated index.
    pub fn sample_result(&self) -> Result<IndexSample> {
        self.check_online("sample_result")?;
        let updates = self.stats.updates_since_sample.load(AtomicOrdering::Relaxed);
        if self.descriptor.unique {
            let tree = self.tree()?;
            return Ok(IndexSample::unique(tree.entry_count()).with_updates(updates));
        }
        let sample = self.sample.lock().unwrap_or_default();
        Ok(sample.with_updates(updates))
    }

    /// Rescans the online tree for entities sharing a value.
    pub fn verify_deferred_constraints(&self) -> Result<()> {
        self.check_online("verify_deferred_constraints")?;
        if !self.descriptor.unique {
            return Ok(());
        }
        let tree = self.tree()?;
        verify_tree_unique(&tree, &Cancellation::new())?;
        debug!(index = %self.descriptor.name, "deferred constraints verified");
        Ok(())
    }

    /// Opens a reader over the online index.
    pub fn new_reader(&self) -> Result<IndexReader> {
        self.check_online("new_reader")?;
        Ok(IndexReader::new(self.descriptor.clone(), self.tree()?))
    }

    /// Records why the population failed. Persisted by `close(false)`.
    pub fn mark_as_failed(&self, message: impl Into<String>) {
        let message = message.into();
        let mut lifecycle = self.lifecycle.lock();
        warn!(index = %self.descriptor.name, reason = %message, "index population marked as failed");
        lifecycle.failure = Some(message);
        lifecycle.state = PopulationState::Failed;
    }

    /// Progress of the whole population given the progress of the scan.
    pub fn progress(&self, scan: PopulationProgress) -> PopulationProgress {
        let stats = &self.stats;
        let mut builder = PopulationProgress::multiple().add(scan, 4);

        let stores = stats.stores_to_merge.load(AtomicOrdering::Relaxed);
        if stores > 0 || !self.scan_stores.read().is_empty() {
            builder = builder.add(
                PopulationProgress::single(
                    stats.stores_merged.load(AtomicOrdering::Relaxed),
                    stores,
                ),
                1,
            );
        }

        let build = if stats.build_started.load(AtomicOrdering::Acquire) {
            let total = stats.scan_entries.load(AtomicOrdering::Relaxed)
                + stats.external_logged.load(AtomicOrdering::Relaxed);
            let done = stats.applied_scan.load(AtomicOrdering::Relaxed)
                + stats.applied_external.load(AtomicOrdering::Relaxed);
            if total == 0 {
                PopulationProgress::done()
            } else {
                PopulationProgress::single(done, total)
            }
        } else {
            PopulationProgress::NONE
        };
        builder.add(build, 2).build()
    }

    /// Cancels any running merge, waits for it to stop and deletes every
    /// temporary file.
    fn close_block_storage(&self) -> Result<()> {
        self.cancellation.cancel();
        let _merging = self.merge_lock.lock();

        let mut stores = std::mem::take(&mut *self.scan_stores.write());
        let external = self.external.lock().take();
        let mut actions: Vec<Box<dyn FnOnce() -> Result<()> + '_>> = stores
            .values_mut()
            .map(|store| {
                Box::new(move || store.get_mut().close()) as Box<dyn FnOnce() -> Result<()> + '_>
            })
            .collect();
        if let Some(mut log) = external {
            actions.push(Box::new(move || log.close()));
        }
        run_all(actions, |e| {
            warn!(index = %self.descriptor.name, error = %e, "failed to release population storage")
        })
    }

    fn finish_tree(&self, success: bool) -> Result<()> {
        let Some(tree) = self.tree.read().clone() else {
            return Ok(());
        };
        if success {
            tree.set_state(IndexState::Online, None)?;
            info!(index = %self.descriptor.name, entries = tree.entry_count(), "index online");
            return Ok(());
        }
        let message = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = PopulationState::Failed;
            let message = lifecycle.failure.as_deref().unwrap_or(DEFAULT_FAILURE);
            truncate_utf8(message, MAX_FAILURE_MESSAGE).to_string()
        };
        tree.set_state(IndexState::Failed, Some(message))
    }

    /// Ends the population.
    ///
    /// `close(true)` persists the index as ONLINE and requires a completed
    /// merge. `close(false)` persists it as FAILED with the failure message.
    /// Temporary files are removed either way.
    pub fn close(&self, success: bool) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return Ok(());
            }
            if lifecycle.state == PopulationState::Creating {
                return Err(IndexError::invalid_state("close called before create"));
            }
            if success && lifecycle.state != PopulationState::Online {
                return Err(IndexError::invalid_state(format!(
                    "cannot close successfully in state {}",
                    lifecycle.state
                )));
            }
            lifecycle.closed = true;
        }
        let actions: Vec<Box<dyn FnOnce() -> Result<()> + '_>> = vec![
            Box::new(|| self.close_block_storage()),
            Box::new(|| self.finish_tree(success)),
        ];
        run_all(actions, |e| {
            warn!(index = %self.descriptor.name, error = %e, "failure while closing populator")
        })
    }

    /// Removes the index and every file it created. Safe to call in any
    /// state and more than once.
    pub fn drop(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.dropped {
                return Ok(());
            }
            lifecycle.dropped = true;
            lifecycle.closed = true;
        }
        let actions: Vec<Box<dyn FnOnce() -> Result<()> + '_>> = vec![
            Box::new(|| self.close_block_storage()),
            Box::new(|| {
                std::mem::drop(self.tree.write().take());
                self.files.delete_all()
            }),
        ];
        let result = run_all(actions, |e| {
            warn!(index = %self.descriptor.name, error = %e, "failure while dropping index")
        });
        info!(index = %self.descriptor.name, "index dropped");
        result
    }
}

/// Applies external updates to a population.
///
/// Before the scan is merged, updates are appended to the side log. Once
/// the index is online they go straight into the tree, with uniqueness
/// checked per update.
pub struct PopulatingUpdater<'p> {
    populator: &'p BlockBasedPopulator,
    closed: bool,
}

impl PopulatingUpdater<'_> {
    pub fn process(&mut self, update: &IndexEntryUpdate) -> Result<()> {
        if self.closed {
            return Err(IndexError::invalid_state("updater has been closed"));
        }
        self.populator.process_update(update)
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.populator
                .updater_open
                .store(false, AtomicOrdering::Release);
        }
    }
}

impl Drop for PopulatingUpdater<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::InlineScheduler;
    use nidx_common::Value;
    use tempfile::tempdir;

    fn populator(dir: &std::path::Path, unique: bool) -> BlockBasedPopulator {
        let descriptor = if unique {
            IndexDescriptor::unique(1, "test", 1)
        } else {
            IndexDescriptor::new(1, "test", 1)
        };
        let config = PopulationConfig {
            block_size: 4096,
            ..Default::default()
        };
        BlockBasedPopulator::new(
            descriptor,
            Arc::new(GenericLayout::new(1)),
            IndexFiles::new(dir, "test"),
            config,
            Arc::new(BufferArena::unbounded()),
        )
        .unwrap()
    }

    fn added(entity: i64, value: i64) -> IndexEntryUpdate {
        IndexEntryUpdate::added(entity, vec![Value::Int(value)])
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), false);
        assert_eq!(populator.state(), PopulationState::Creating);
        assert!(populator.add(0, &[added(1, 1)]).is_err());

        populator.create().unwrap();
        assert_eq!(populator.state(), PopulationState::Scanning);
        assert!(populator.create().is_err());
        assert!(matches!(
            populator.new_reader(),
            Err(IndexError::InvalidState(_))
        ));

        populator.add(0, &[added(1, 1), added(2, 2)]).unwrap();
        populator.scan_completed(&InlineScheduler).unwrap();
        assert_eq!(populator.state(), PopulationState::Online);
        assert!(populator.add(0, &[added(3, 3)]).is_err());
        assert!(populator.scan_completed(&InlineScheduler).is_err());

        populator.close(true).unwrap();
        let tree = populator.tree().unwrap();
        assert_eq!(tree.state(), IndexState::Online);
        assert_eq!(tree.entry_count(), 2);
    }

    #[test]
    fn test_scan_entries_must_be_additions() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), false);
        populator.create().unwrap();
        let result = populator.add(0, &[IndexEntryUpdate::removed(1, vec![Value::Int(1)])]);
        assert!(matches!(result, Err(IndexError::InvalidArgument(_))));
    }

    #[test]
    fn test_oversized_removal_is_ignored() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), false);
        populator.create().unwrap();
        populator.add(0, &[added(1, 1)]).unwrap();
        let huge = Value::text("x".repeat(70_000));
        let wide = Value::text("y".repeat(MAX_ENTRY_SIZE));

        let mut updater = populator.new_populating_updater().unwrap();
        updater
            .process(&IndexEntryUpdate::removed(2, vec![huge.clone()]))
            .unwrap();
        updater
            .process(&IndexEntryUpdate::removed(3, vec![wide]))
            .unwrap();
        updater
            .process(&IndexEntryUpdate::changed(4, vec![huge.clone()], vec![Value::Int(4)]))
            .unwrap();
        updater.close();

        populator.scan_completed(&InlineScheduler).unwrap();
        let tree = populator.tree().unwrap();
        assert_eq!(tree.entry_count(), 2);

        let mut updater = populator.new_populating_updater().unwrap();
        updater
            .process(&IndexEntryUpdate::removed(1, vec![huge]))
            .unwrap();
        updater.close();
        assert_eq!(tree.entry_count(), 2);
        populator.close(true).unwrap();
    }

    #[test]
    fn test_close_success_requires_online() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), false);
        populator.create().unwrap();
        assert!(matches!(
            populator.close(true),
            Err(IndexError::InvalidState(_))
        ));
        populator.close(false).unwrap();
        assert_eq!(populator.state(), PopulationState::Failed);
    }

    #[test]
    fn test_updater_after_online_writes_directly() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), true);
        populator.create().unwrap();
        populator.add(0, &[added(1, 10)]).unwrap();
        populator.scan_completed(&InlineScheduler).unwrap();

        let mut updater = populator.new_populating_updater().unwrap();
        updater.process(&added(2, 20)).unwrap();
        match updater.process(&added(3, 10)) {
            Err(IndexError::Conflict { existing, added, .. }) => {
                assert_eq!(existing, 1);
                assert_eq!(added, 3);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        updater.close();
        assert_eq!(populator.tree().unwrap().entry_count(), 2);
        assert!(updater.process(&added(4, 40)).is_err());
    }

    #[test]
    fn test_online_change_rolls_back_on_conflict() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), true);
        populator.create().unwrap();
        populator.add(0, &[added(1, 10), added(2, 20)]).unwrap();
        populator.scan_completed(&InlineScheduler).unwrap();

        let mut updater = populator.new_populating_updater().unwrap();
        let change = IndexEntryUpdate::changed(2, vec![Value::Int(20)], vec![Value::Int(10)]);
        assert!(updater.process(&change).is_err());

        let tree = populator.tree().unwrap();
        let keys: Vec<i64> = tree
            .scan(nidx_storage::SeekOrder::Ascending)
            .map(|k| k.entity_id())
            .collect();
        assert_eq!(keys, vec![1, 2]);
    }

    #[test]
    fn test_mark_as_failed_persists_message() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), false);
        populator.create().unwrap();
        populator.mark_as_failed("scan aborted: disk full");
        assert_eq!(populator.state(), PopulationState::Failed);
        populator.close(false).unwrap();

        let header = populator.tree().unwrap().header();
        assert_eq!(header.state, IndexState::Failed);
        assert_eq!(
            header.failure_message.as_deref(),
            Some("scan aborted: disk full")
        );
    }

    #[test]
    fn test_non_unique_sample() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), false);
        populator.create().unwrap();
        let batch: Vec<_> = (0..100).map(|i| added(i, i % 10)).collect();
        populator.add(0, &batch[..50]).unwrap();
        populator.add(1, &batch[50..]).unwrap();
        let mut updater = populator.new_populating_updater().unwrap();
        updater.process(&added(500, 77)).unwrap();
        updater.close();
        assert!(matches!(
            populator.sample_result(),
            Err(IndexError::InvalidState(_))
        ));

        populator.scan_completed(&InlineScheduler).unwrap();
        let sample = populator.sample_result().unwrap();
        assert_eq!(sample.index_size, 100);
        assert_eq!(sample.unique_values, 10);
        assert_eq!(sample.sample_size, 100);
        assert_eq!(sample.updates, 1);
    }

    #[test]
    fn test_progress_reaches_completion() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), false);
        populator.create().unwrap();
        populator.add(0, &[added(1, 1)]).unwrap();
        let before = populator.progress(PopulationProgress::single(1, 1));
        assert!(before.fraction() < 1.0);

        populator.scan_completed(&InlineScheduler).unwrap();
        let after = populator.progress(PopulationProgress::done());
        assert!((after.fraction() - 1.0).abs() < 1e-6);
    }
}
