//! Population split into independent parts that are merged at the end.
//!
//! Each scan worker owns one part, a complete block-based population with
//! its own tree under `<name>.parts/<worker>/`, created on the worker's
//! first `add`. When the scan completes the parts are populated in parallel
//! and their trees are fed into a final population at the index's own
//! location. External updates seen before that point go to every part and
//! to the final population's side log, which replays them over the merged
//! entries so that parts created after an update still observe it.

use crate::descriptor::IndexDescriptor;
use crate::files::IndexFiles;
use crate::populator::{BlockBasedPopulator, PopulatingUpdater, PopulationState};
use crate::progress::PopulationProgress;
use crate::reader::IndexReader;
use crate::sample::IndexSample;
use crate::scheduler::{InlineScheduler, Job, WorkScheduler};
use crate::update::IndexEntryUpdate;
use nidx_buffer::BufferArena;
use nidx_common::{run_all, IndexError, PopulationConfig, Result};
use nidx_storage::{GenericLayout, IndexKey, SeekOrder};
use parking_lot::RwLock;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Keys copied from a part tree per batch.
const COPY_BATCH: usize = 1024;

type Cleanup<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

pub struct PartitionedPopulator {
    descriptor: IndexDescriptor,
    layout: Arc<GenericLayout>,
    files: IndexFiles,
    config: PopulationConfig,
    arena: Arc<BufferArena>,
    /// Parts by worker id.
    parts: RwLock<BTreeMap<usize, BlockBasedPopulator>>,
    merged: BlockBasedPopulator,
    /// True once every part has been folded into `merged`.
    phase: RwLock<bool>,
    updater_open: AtomicBool,
}

impl PartitionedPopulator {
    pub fn new(
        descriptor: IndexDescriptor,
        layout: Arc<GenericLayout>,
        files: IndexFiles,
        config: PopulationConfig,
        arena: Arc<BufferArena>,
    ) -> Result<Self> {
        let merged = BlockBasedPopulator::new(
            descriptor.clone(),
            Arc::clone(&layout),
            files.clone(),
            config.clone(),
            Arc::clone(&arena),
        )?;
        Ok(Self {
            descriptor,
            layout,
            files,
            config,
            arena,
            parts: RwLock::new(BTreeMap::new()),
            merged,
            phase: RwLock::new(false),
            updater_open: AtomicBool::new(false),
        })
    }

    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    /// Number of parts created so far.
    pub fn part_count(&self) -> usize {
        self.parts.read().len()
    }

    pub fn state(&self) -> PopulationState {
        self.merged.state()
    }

    pub fn is_merged(&self) -> bool {
        *self.phase.read()
    }

    pub fn create(&self) -> Result<()> {
        // The final population clears the index directory, parts included.
        self.merged.create()?;
        debug!(index = %self.descriptor.name, "partitioned population created");
        Ok(())
    }

    fn new_part(&self, worker: usize) -> Result<BlockBasedPopulator> {
        let part = BlockBasedPopulator::new(
            self.descriptor.clone(),
            Arc::clone(&self.layout),
            self.files.part(worker),
            self.config.clone(),
            Arc::clone(&self.arena),
        )?;
        part.create()?;
        debug!(index = %self.descriptor.name, worker, "population part created");
        Ok(part)
    }

    /// Adds scanned entries to the part owned by `worker`, creating the
    /// part on the worker's first call.
    pub fn add(&self, worker: usize, updates: &[IndexEntryUpdate]) -> Result<()> {
        {
            let parts = self.parts.read();
            if let Some(part) = parts.get(&worker) {
                return part.add(0, updates);
            }
        }
        let mut parts = self.parts.write();
        let part = match parts.entry(worker) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let state = self.merged.state();
                if state != PopulationState::Scanning {
                    return Err(IndexError::invalid_state(format!(
                        "add called in state {}",
                        state
                    )));
                }
                entry.insert(self.new_part(worker)?)
            }
        };
        part.add(0, updates)
    }

    pub fn include_sample(&self, update: &IndexEntryUpdate) {
        self.merged.include_sample(update)
    }

    pub fn new_populating_updater(&self) -> Result<PartitionedUpdater<'_>> {
        if self
            .updater_open
            .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_err()
        {
            return Err(IndexError::invalid_state(
                "a populating updater is already open",
            ));
        }
        let opened = self.open_updater();
        if opened.is_err() {
            self.updater_open.store(false, AtomicOrdering::Release);
        }
        opened
    }

    fn open_updater(&self) -> Result<PartitionedUpdater<'_>> {
        let merged = if *self.phase.read() {
            Some(self.merged.new_populating_updater()?)
        } else {
            match self.merged.state() {
                PopulationState::Scanning => None,
                state => {
                    return Err(IndexError::invalid_state(format!(
                        "populating updater requested in state {}",
                        state
                    )))
                }
            }
        };
        Ok(PartitionedUpdater {
            populator: self,
            merged,
            closed: false,
        })
    }

    /// Applies a pre-merge update to every part and to the final log.
    fn fan_out(&self, update: &IndexEntryUpdate) -> Result<()> {
        let parts = self.parts.read();
        for part in parts.values() {
            part.process_update(update)?;
        }
        self.merged.process_update(update)
    }

    /// Populates every part and merges them into the final index.
    pub fn scan_completed(&self, scheduler: &dyn WorkScheduler) -> Result<()> {
        let mut merged = self.phase.write();
        if *merged {
            return Err(IndexError::invalid_state("scan already completed"));
        }
        if self.merged.is_closed() {
            return Ok(());
        }
        let started = Instant::now();
        if let Err(e) = self.merge_parts(scheduler) {
            self.merged.mark_as_failed(e.to_string());
            return Err(e);
        }
        *merged = true;
        let part_count = self.part_count();
        self.drop_parts()?;
        info!(
            index = %self.descriptor.name,
            parts = part_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "partitioned population merged"
        );
        Ok(())
    }

    fn merge_parts(&self, scheduler: &dyn WorkScheduler) -> Result<()> {
        let parts = self.parts.read();
        let jobs: Vec<Job<'_>> = parts
            .values()
            .map(|part| Box::new(move || part.scan_completed(&InlineScheduler)) as Job<'_>)
            .collect();
        scheduler.run_all("populate-parts", jobs)?;

        for part in parts.values() {
            let tree = part.tree()?;
            let mut batch: Vec<IndexKey> = Vec::with_capacity(COPY_BATCH);
            for key in tree.scan(SeekOrder::Ascending) {
                batch.push(key);
                if batch.len() == COPY_BATCH {
                    self.merged.add_keys(0, batch.iter())?;
                    batch.clear();
                }
            }
            self.merged.add_keys(0, batch.iter())?;
        }
        // Parts stay locked so no worker opens a new one mid-merge.
        self.merged.scan_completed(scheduler)?;
        if self.merged.state() != PopulationState::Online {
            return Err(IndexError::invalid_state(format!(
                "merged population ended in state {}",
                self.merged.state()
            )));
        }
        Ok(())
    }

    fn ensure_merged(&self) -> Result<()> {
        if *self.phase.read() {
            return Ok(());
        }
        if self.merged.state() == PopulationState::Failed {
            return Err(IndexError::invalid_state("population has failed"));
        }
        match self.scan_completed(&InlineScheduler) {
            Ok(()) => Ok(()),
            // Another caller merged in between.
            Err(IndexError::InvalidState(_)) if *self.phase.read() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drops every part, then the parts directory.
    fn drop_parts(&self) -> Result<()> {
        let parts = std::mem::take(&mut *self.parts.write());
        let mut actions: Vec<Cleanup<'_>> = parts
            .into_values()
            .map(|part| Box::new(move || part.drop()) as Cleanup<'_>)
            .collect();
        actions.push(Box::new(|| match fs::remove_dir_all(self.files.parts_dir()) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }));
        run_all(actions, |e| {
            warn!(index = %self.descriptor.name, error = %e, "failed to remove population part")
        })
    }

    pub fn sample_result(&self) -> Result<IndexSample> {
        self.ensure_merged()?;
        self.merged.sample_result()
    }

    pub fn verify_deferred_constraints(&self) -> Result<()> {
        self.ensure_merged()?;
        self.merged.verify_deferred_constraints()
    }

    pub fn new_reader(&self) -> Result<IndexReader> {
        if !*self.phase.read() {
            return Err(IndexError::invalid_state(
                "reader requested before the parts were merged",
            ));
        }
        self.merged.new_reader()
    }

    pub fn mark_as_failed(&self, message: impl Into<String>) {
        self.merged.mark_as_failed(message)
    }

    pub fn failure_message(&self) -> Option<String> {
        self.merged.failure_message()
    }

    pub fn progress(&self, scan: PopulationProgress) -> PopulationProgress {
        if *self.phase.read() {
            return self.merged.progress(PopulationProgress::done());
        }
        let mut builder = PopulationProgress::multiple();
        for part in self.parts.read().values() {
            builder = builder.add(part.progress(scan), 1);
        }
        builder.add(self.merged.progress(PopulationProgress::NONE), 1).build()
    }

    pub fn close(&self, success: bool) -> Result<()> {
        if *self.phase.read() {
            return self.merged.close(success);
        }
        if success {
            // Not merged yet, so this fails with the reason.
            return self.merged.close(true);
        }
        let actions: Vec<Cleanup<'_>> = vec![
            Box::new(|| self.merged.close(false)),
            Box::new(|| self.drop_parts()),
        ];
        run_all(actions, |e| {
            warn!(index = %self.descriptor.name, error = %e, "failure while closing partitioned population")
        })
    }

    pub fn drop(&self) -> Result<()> {
        let actions: Vec<Cleanup<'_>> = vec![
            Box::new(|| self.drop_parts()),
            Box::new(|| self.merged.drop()),
        ];
        run_all(actions, |e| {
            warn!(index = %self.descriptor.name, error = %e, "failure while dropping partitioned population")
        })
    }
}

/// Updater fanning changes out to every part until they are merged.
pub struct PartitionedUpdater<'a> {
    populator: &'a PartitionedPopulator,
    merged: Option<PopulatingUpdater<'a>>,
    closed: bool,
}

impl PartitionedUpdater<'_> {
    pub fn process(&mut self, update: &IndexEntryUpdate) -> Result<()> {
        if self.closed {
            return Err(IndexError::invalid_state("updater has been closed"));
        }
        let populator = self.populator;
        let merged = populator.phase.read();
        if !*merged {
            return populator.fan_out(update);
        }
        if self.merged.is_none() {
            self.merged = Some(populator.merged.new_populating_updater()?);
        }
        match self.merged.as_mut() {
            Some(updater) => updater.process(update),
            None => Err(IndexError::Internal("merged updater missing".to_string())),
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.merged = None;
        self.populator
            .updater_open
            .store(false, AtomicOrdering::Release);
    }
}

impl Drop for PartitionedUpdater<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{IndexOrder, IndexQuery};
    use nidx_common::Value;
    use tempfile::tempdir;

    fn populator(dir: &std::path::Path, unique: bool, workers: usize) -> PartitionedPopulator {
        let descriptor = if unique {
            IndexDescriptor::unique(3, "parts", 1)
        } else {
            IndexDescriptor::new(3, "parts", 1)
        };
        let config = PopulationConfig {
            block_size: 4096,
            population_workers: workers,
            ..Default::default()
        };
        PartitionedPopulator::new(
            descriptor,
            Arc::new(GenericLayout::new(1)),
            IndexFiles::new(dir, "parts"),
            config,
            Arc::new(BufferArena::unbounded()),
        )
        .unwrap()
    }

    fn added(entity: i64, value: i64) -> IndexEntryUpdate {
        IndexEntryUpdate::added(entity, vec![Value::Int(value)])
    }

    #[test]
    fn test_parts_merge_into_one_index() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), true, 3);
        populator.create().unwrap();
        assert_eq!(populator.part_count(), 0);
        assert!(!dir.path().join("parts.parts").exists());

        for worker in 0..3 {
            let batch: Vec<_> = (0..50)
                .map(|i| {
                    let id = (worker * 50 + i) as i64;
                    added(id, id)
                })
                .collect();
            populator.add(worker, &batch).unwrap();
        }
        populator.add(7, &[added(1000, 1000)]).unwrap();
        assert_eq!(populator.part_count(), 4);
        assert!(dir.path().join("parts.parts").join("7").exists());

        {
            let mut updater = populator.new_populating_updater().unwrap();
            updater.process(&added(500, 500)).unwrap();
            updater
                .process(&IndexEntryUpdate::removed(7, vec![Value::Int(7)]))
                .unwrap();
        }

        populator.scan_completed(&InlineScheduler).unwrap();
        assert!(populator.is_merged());
        assert_eq!(populator.part_count(), 0);
        assert!(!dir.path().join("parts.parts").exists());
        assert!(matches!(
            populator.add(8, &[added(2000, 2000)]),
            Err(IndexError::InvalidState(_))
        ));

        let reader = populator.new_reader().unwrap();
        assert_eq!(reader.entry_count(), 151);
        assert_eq!(reader.count(&[IndexQuery::exact(Value::Int(7))]).unwrap(), 0);
        assert_eq!(reader.count(&[IndexQuery::exact(Value::Int(500))]).unwrap(), 1);
        let first: Vec<i64> = reader
            .query(IndexOrder::Descending, false, &[IndexQuery::Exists])
            .unwrap()
            .take(2)
            .map(|hit| hit.unwrap().entity_id)
            .collect();
        assert_eq!(first, vec![1000, 500]);

        populator.close(true).unwrap();
        assert_eq!(populator.state(), PopulationState::Online);
    }

    #[test]
    fn test_part_created_after_update_still_sees_it() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), false, 2);
        populator.create().unwrap();
        {
            let mut updater = populator.new_populating_updater().unwrap();
            updater
                .process(&IndexEntryUpdate::removed(1, vec![Value::Int(1)]))
                .unwrap();
            updater.process(&added(9, 9)).unwrap();
        }
        populator.add(0, &[added(1, 1), added(2, 2)]).unwrap();
        populator.add(1, &[added(3, 3)]).unwrap();

        populator.scan_completed(&InlineScheduler).unwrap();
        let reader = populator.new_reader().unwrap();
        assert_eq!(reader.entry_count(), 3);
        assert_eq!(reader.count(&[IndexQuery::exact(Value::Int(1))]).unwrap(), 0);
        assert_eq!(reader.count(&[IndexQuery::exact(Value::Int(9))]).unwrap(), 1);
        populator.close(true).unwrap();
    }

    #[test]
    fn test_duplicate_across_parts_fails() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), true, 2);
        populator.create().unwrap();
        populator.add(0, &[added(1, 42)]).unwrap();
        populator.add(1, &[added(2, 42)]).unwrap();

        let result = populator.scan_completed(&InlineScheduler);
        assert!(matches!(result, Err(IndexError::Conflict { .. })));
        assert_eq!(populator.state(), PopulationState::Failed);
        assert!(populator.failure_message().is_some());

        populator.close(false).unwrap();
        populator.drop().unwrap();
        assert!(!dir.path().join("parts.idx").exists());
    }

    #[test]
    fn test_updater_switches_to_merged_index() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), false, 2);
        populator.create().unwrap();
        populator.add(0, &[added(1, 1)]).unwrap();
        populator.add(1, &[added(2, 2)]).unwrap();

        let mut updater = populator.new_populating_updater().unwrap();
        assert!(populator.new_populating_updater().is_err());
        updater.process(&added(3, 3)).unwrap();

        let sample = populator.sample_result().unwrap();
        assert_eq!(sample.index_size, 3);

        updater.process(&added(4, 4)).unwrap();
        updater.close();
        assert_eq!(populator.new_reader().unwrap().entry_count(), 4);
        populator.close(true).unwrap();
    }

    #[test]
    fn test_progress_before_and_after_merge() {
        let dir = tempdir().unwrap();
        let populator = populator(dir.path(), false, 2);
        populator.create().unwrap();
        populator.add(0, &[added(1, 1)]).unwrap();
        let before = populator.progress(PopulationProgress::single(1, 2));
        assert!(before.fraction() < 1.0);

        populator.scan_completed(&InlineScheduler).unwrap();
        let after = populator.progress(PopulationProgress::done());
        assert_eq!(after.fraction(), 1.0);
    }
}
