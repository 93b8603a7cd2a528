//! The database engine.
//!
//! Ties the write-ahead log, memtable pair, version set, and background
//! compaction together under a single-writer discipline:
//!
//! - Caller threads enqueue writes; a dedicated write worker drains the
//!   queue, batching consecutive writers into one WAL record and applying
//!   it to the memtable. Only the worker touches the WAL or inserts into
//!   the active memtable.
//! - One background worker runs at most one flush-or-compaction at a
//!   time, woken over a channel whenever work appears.
//! - Readers never block writers: they pin the memtables and the current
//!   version and read lock-free.

pub mod builder;
pub mod db_iter;
pub mod filename;

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::batch::WriteBatch;
use crate::cache::ShardedCache;
use crate::comparator::{Comparator, InternalKeyComparator};
use crate::config::{
    Options, ReadOptions, WriteOptions, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
    NUM_LEVELS, NUM_NON_TABLE_CACHE_FILES,
};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::iterator::{Iter, MergingIterator};
use crate::key::{
    check_sequence_room, InternalKey, LookupKey, SequenceNumber, ValueType, VALUE_TYPE_FOR_SEEK,
};
use crate::memtable::{MemTable, MemtableGet};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::table::block::Block;
use crate::table::TableBuilder;
use crate::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::set::{Compaction, VersionSet};
use crate::version::Version;
use crate::wal::{LogReader, LogWriter};
use db_iter::DbIterator;
use filename::*;

/// A queued write and the channel its result travels back on.
struct Writer {
    batch: WriteBatch,
    sync: bool,
    done: Sender<Result<()>>,
}

/// One requested manual compaction; re-armed round by round until done.
struct ManualCompaction {
    level: usize,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
    done: bool,
}

/// State guarded by the background mutex/condvar pair.
struct BgState {
    compaction_scheduled: bool,
    /// Latched on the first background failure; suppresses further
    /// background work and fails subsequent writes fast.
    error: Option<Error>,
    manual: Option<Arc<Mutex<ManualCompaction>>>,
}

#[derive(Default, Clone, Copy)]
struct CompactionStats {
    micros: u64,
    bytes_read: u64,
    bytes_written: u64,
}

impl CompactionStats {
    fn add(&mut self, other: CompactionStats) {
        self.micros += other.micros;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

/// One table file being produced by a compaction.
struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

struct CompactionState<'a> {
    compaction: &'a mut Compaction,
    /// Entries with sequence <= this are invisible to every live reader.
    smallest_snapshot: SequenceNumber,
    outputs: Vec<CompactionOutput>,
    builder: Option<TableBuilder>,
    total_bytes: u64,
}

impl<'a> CompactionState<'a> {
    fn new(compaction: &'a mut Compaction) -> Self {
        Self {
            compaction,
            smallest_snapshot: 0,
            outputs: Vec::new(),
            builder: None,
            total_bytes: 0,
        }
    }

    fn current_output(&mut self) -> &mut CompactionOutput {
        self.outputs.last_mut().expect("an output is open")
    }
}

pub(crate) struct DbInner {
    path: PathBuf,
    options: Options,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    block_cache: Arc<ShardedCache<Block>>,

    mem: RwLock<Option<Arc<MemTable>>>,
    imm: RwLock<Option<Arc<MemTable>>>,
    has_imm: AtomicBool,

    wal: Mutex<Option<LogWriter>>,
    wal_number: AtomicU64,

    versions: Mutex<VersionSet>,

    writers: Mutex<VecDeque<Writer>>,
    write_wake: (Sender<()>, Receiver<()>),
    compact_wake: (Sender<()>, Receiver<()>),

    bg: Mutex<BgState>,
    bg_cv: Condvar,

    pending_outputs: Mutex<HashSet<u64>>,
    snapshots: SnapshotList,
    shutting_down: AtomicBool,
    stats: Mutex<[CompactionStats; NUM_LEVELS]>,
    iter_seed: AtomicU64,
    _lock: Mutex<Option<FileLock>>,
}

impl DbInner {
    pub(crate) fn ucmp(&self) -> Arc<dyn Comparator> {
        self.options.comparator.clone()
    }

    pub(crate) fn read_sample_period(&self) -> usize {
        self.options.read_sample_period_bytes
    }

    /// Charges an iterated key against the files it passes through;
    /// schedules compaction when a file's seek budget runs dry.
    pub(crate) fn record_read_sample(&self, internal_key: &[u8]) {
        let current = self.versions.lock().unwrap().current();
        if current.record_read_sample(internal_key) {
            self.maybe_schedule_compaction();
        }
    }

    fn bg_error(&self) -> Option<Error> {
        self.bg.lock().unwrap().error.clone()
    }

    fn record_background_error(&self, e: Error) {
        let mut bg = self.bg.lock().unwrap();
        if bg.error.is_none() {
            error!(error = %e, "background error; suspending background work");
            bg.error = Some(e);
        }
        self.bg_cv.notify_all();
    }

    /// Wakes everyone waiting on background progress. The lock is taken
    /// even without state changes so waiters cannot miss the signal.
    fn signal_background_done(&self) {
        let _bg = self.bg.lock().unwrap();
        self.bg_cv.notify_all();
    }

    fn maybe_schedule_compaction(&self) {
        let mut bg = self.bg.lock().unwrap();
        if bg.compaction_scheduled {
            return;
        }
        if self.shutting_down.load(Ordering::Acquire) || bg.error.is_some() {
            return;
        }
        let has_work = self.has_imm.load(Ordering::Acquire)
            || bg.manual.is_some()
            || self.versions.lock().unwrap().needs_compaction();
        if !has_work {
            return;
        }
        bg.compaction_scheduled = true;
        drop(bg);
        let _ = self.compact_wake.0.send(());
    }

    // ----- write path -----------------------------------------------------

    /// Groups the leader with queued writers of compatible sync-ness, up
    /// to a size cap that keeps small writes latency-friendly.
    fn build_batch_group(&self, first: &mut Writer) -> Vec<Sender<Result<()>>> {
        let mut senders = vec![first.done.clone()];

        let mut size = first.batch.byte_size();
        let max_size = if size <= 128 << 10 {
            size + (128 << 10)
        } else {
            1 << 20
        };

        let mut queue = self.writers.lock().unwrap();
        while let Some(w) = queue.front() {
            // A sync write must not ride in a non-sync group.
            if w.sync && !first.sync {
                break;
            }
            if w.batch.is_empty() {
                // Flush-waiters run alone.
                break;
            }
            size += w.batch.byte_size();
            if size > max_size {
                break;
            }
            let w = queue.pop_front().unwrap();
            first.batch.append(&w.batch);
            senders.push(w.done);
        }
        senders
    }

    /// Ensures the active memtable has room, applying backpressure and
    /// rotating to a fresh memtable + WAL when full. Runs on the write
    /// worker only.
    fn make_room_for_write(&self, mut force: bool) -> Result<()> {
        let mut allow_delay = !force;
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::Io("database closed".to_string()));
            }
            if let Some(e) = self.bg_error() {
                return Err(e);
            }

            if allow_delay
                && self.versions.lock().unwrap().num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Near the hard limit: shed 1ms per write instead of
                // stalling for seconds once the limit is hit.
                std::thread::sleep(std::time::Duration::from_millis(1));
                allow_delay = false;
                continue;
            }

            if !force {
                let mem = self.mem.read().unwrap();
                let usage = mem.as_ref().map_or(0, |m| m.approximate_memory_usage());
                if usage <= self.options.write_buffer_size {
                    return Ok(());
                }
            }

            if self.has_imm.load(Ordering::Acquire) {
                // Previous memtable still flushing; wait it out.
                debug!("memtable full; waiting for flush");
                let bg = self.bg.lock().unwrap();
                if bg.error.is_none() && self.has_imm.load(Ordering::Acquire) {
                    let _unused = self.bg_cv.wait(bg).unwrap();
                }
                continue;
            }

            if self.versions.lock().unwrap().num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                info!("too many level-0 files; stalling writes");
                let bg = self.bg.lock().unwrap();
                if bg.error.is_none()
                    && self.versions.lock().unwrap().num_level_files(0) >= L0_STOP_WRITES_TRIGGER
                {
                    let _unused = self.bg_cv.wait(bg).unwrap();
                }
                continue;
            }

            // Rotate: fresh WAL, current memtable becomes immutable.
            let new_log_number = self.versions.lock().unwrap().new_file_number();
            let file = match File::create(log_file_name(&self.path, new_log_number)) {
                Ok(f) => f,
                Err(e) => {
                    // Do not burn through file numbers on a failing disk.
                    self.versions.lock().unwrap().reuse_file_number(new_log_number);
                    return Err(e.into());
                }
            };
            *self.wal.lock().unwrap() = Some(LogWriter::new(file));
            self.wal_number.store(new_log_number, Ordering::Release);

            {
                // Readers snapshot (mem, imm, current) under the versions
                // lock; holding it across the swap keeps the pair coherent.
                let _versions = self.versions.lock().unwrap();
                let old_mem = self.mem.write().unwrap().take();
                *self.imm.write().unwrap() = old_mem;
                self.has_imm.store(true, Ordering::Release);
                *self.mem.write().unwrap() = Some(Arc::new(MemTable::new(self.icmp.clone())));
            }
            debug!(wal = new_log_number, "rotated memtable");

            force = false;
            self.maybe_schedule_compaction();
        }
    }

    /// The write worker: leader batching, WAL append, memtable apply.
    fn write_worker(self: &Arc<Self>) {
        while self.write_wake.1.recv().is_ok() {
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }
            let mut first = {
                let mut queue = self.writers.lock().unwrap();
                match queue.pop_front() {
                    Some(w) => w,
                    None => continue,
                }
            };

            let force = first.batch.is_empty();
            let mut result = self.make_room_for_write(force);

            if force {
                // Flush-wait only: the rotation (if any) is scheduled.
                let _ = first.done.send(result);
                continue;
            }

            let senders = if result.is_ok() {
                self.build_batch_group(&mut first)
            } else {
                vec![first.done.clone()]
            };

            if result.is_ok() {
                let mut last_sequence = self.versions.lock().unwrap().last_sequence();
                result = check_sequence_room(last_sequence, first.batch.count() as u64);
                if result.is_ok() {
                    first.batch.set_sequence(last_sequence + 1);
                    last_sequence += first.batch.count() as u64;

                    // Only this worker touches the WAL and the active
                    // memtable; readers walk the memtable concurrently.
                    result = self.log_and_apply_batch(&first.batch, first.sync);
                    if result.is_ok() {
                        self.versions.lock().unwrap().set_last_sequence(last_sequence);
                    }
                }
            }

            for sender in senders {
                let _ = sender.send(result.clone());
            }
        }
        debug!("write worker exiting");
        self.fail_queued_writers();
    }

    fn log_and_apply_batch(&self, batch: &WriteBatch, sync: bool) -> Result<()> {
        {
            let mut wal = self.wal.lock().unwrap();
            let log = wal.as_mut().expect("wal open while writing");
            log.add_record(batch.contents())?;
            if sync {
                if let Err(e) = log.sync() {
                    // The tail of the WAL is in an unknown state; fail all
                    // future writes rather than risk losing acknowledged
                    // data.
                    self.record_background_error(e.clone());
                    return Err(e);
                }
            } else {
                log.flush()?;
            }
        }
        let mem = self.mem.read().unwrap().clone().expect("active memtable");
        batch.insert_into(&mem)
    }

    fn fail_queued_writers(&self) {
        let mut queue = self.writers.lock().unwrap();
        while let Some(w) = queue.pop_front() {
            let _ = w.done.send(Err(Error::Io("database closed".to_string())));
        }
    }

    // ----- background work ------------------------------------------------

    fn background_worker(self: &Arc<Self>) {
        while self.compact_wake.1.recv().is_ok() {
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }
            if self.bg_error().is_none() {
                self.background_compaction();
            }
            {
                let mut bg = self.bg.lock().unwrap();
                bg.compaction_scheduled = false;
            }
            // This round may have created enough files to need another.
            self.maybe_schedule_compaction();
            self.signal_background_done();
        }
        debug!("background worker exiting");
    }

    fn background_compaction(&self) {
        if self.has_imm.load(Ordering::Acquire) {
            self.compact_memtable();
            return;
        }

        let manual = self.bg.lock().unwrap().manual.clone();
        let is_manual = manual.is_some();
        let mut manual_end = None;

        let compaction = if let Some(m) = &manual {
            let mut m = m.lock().unwrap();
            let c = self.versions.lock().unwrap().compact_range(
                m.level,
                m.begin.as_ref(),
                m.end.as_ref(),
            );
            m.done = c.is_none();
            if let Some(c) = &c {
                manual_end = Some(c.input(0, c.num_input_files(0) - 1).largest.clone());
            }
            info!(
                level = m.level,
                done = m.done,
                "manual compaction round"
            );
            c
        } else {
            self.versions.lock().unwrap().pick_compaction()
        };

        let mut result = Ok(());
        match compaction {
            None => {}
            Some(mut c) if !is_manual && c.is_trivial_move() => {
                // Relabel the file to the next level without rewriting it.
                let f = Arc::clone(c.input(0, 0));
                let level = c.level();
                let edit = c.edit_mut();
                edit.delete_file(level, f.number);
                edit.add_file(
                    level + 1,
                    f.number,
                    f.size,
                    f.smallest.clone(),
                    f.largest.clone(),
                );
                result = self.versions.lock().unwrap().log_and_apply(c.edit_mut());
                if let Err(e) = &result {
                    self.record_background_error(e.clone());
                }
                info!(
                    file = f.number,
                    to_level = level + 1,
                    bytes = f.size,
                    summary = %self.versions.lock().unwrap().level_summary(),
                    "trivial move"
                );
            }
            Some(mut c) => {
                let mut compact = CompactionState::new(&mut c);
                result = self.do_compaction_work(&mut compact);
                if let Err(e) = &result {
                    self.record_background_error(e.clone());
                }
                self.cleanup_compaction(&mut compact);
                c.release_inputs();
                self.remove_obsolete_files();
            }
        }

        match &result {
            Err(e) if !self.shutting_down.load(Ordering::Acquire) => {
                warn!(error = %e, "compaction error");
            }
            _ => {}
        }

        if let Some(m) = manual {
            let mut m = m.lock().unwrap();
            if result.is_err() {
                m.done = true;
            }
            if !m.done {
                // Resume after the keys this round consumed.
                m.begin = manual_end;
            }
            self.bg.lock().unwrap().manual = None;
        }
    }

    /// Flushes the immutable memtable to a table file and retires its WAL.
    fn compact_memtable(&self) {
        let Some(imm) = self.imm.read().unwrap().clone() else {
            return;
        };

        let mut edit = VersionEdit::new();
        let base = self.versions.lock().unwrap().current();
        let mut result = self.write_level0_table(&imm, &mut edit, Some(&base));

        if result.is_ok() && self.shutting_down.load(Ordering::Acquire) {
            result = Err(Error::Io(
                "deleting db during memtable compaction".to_string(),
            ));
        }

        if result.is_ok() {
            edit.set_prev_log_number(0);
            // Earlier WALs are fully covered by this table now.
            edit.set_log_number(self.wal_number.load(Ordering::Acquire));
            result = self.versions.lock().unwrap().log_and_apply(&mut edit);
        }

        match result {
            Ok(()) => {
                *self.imm.write().unwrap() = None;
                self.has_imm.store(false, Ordering::Release);
                self.remove_obsolete_files();
                self.signal_background_done();
            }
            Err(e) => {
                self.record_background_error(e);
            }
        }
    }

    /// Builds one table from `mem` and registers it in `edit`, placed at
    /// the deepest safe level when a base version is given.
    fn write_level0_table(
        &self,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Arc<Version>>,
    ) -> Result<()> {
        let start = Instant::now();
        let file_number = self.versions.lock().unwrap().new_file_number();
        self.pending_outputs.lock().unwrap().insert(file_number);
        info!(file = file_number, "level-0 flush started");

        let result = builder::build_table(
            &self.path,
            &self.options,
            &self.table_cache,
            Box::new(mem.iter()),
            file_number,
        );
        self.pending_outputs.lock().unwrap().remove(&file_number);

        let mut level = 0;
        let written = match result {
            Ok(Some(meta)) => {
                if let Some(base) = base {
                    level = base.pick_level_for_memtable_output(
                        meta.smallest.user_key(),
                        meta.largest.user_key(),
                    );
                }
                let bytes = meta.size;
                edit.add_file(level, meta.number, meta.size, meta.smallest, meta.largest);
                bytes
            }
            Ok(None) => 0,
            Err(e) => return Err(e),
        };

        let mut stats = self.stats.lock().unwrap();
        stats[level].add(CompactionStats {
            micros: start.elapsed().as_micros() as u64,
            bytes_read: 0,
            bytes_written: written,
        });
        Ok(())
    }

    fn open_compaction_output_file(&self, compact: &mut CompactionState) -> Result<()> {
        debug_assert!(compact.builder.is_none());
        let file_number = self.versions.lock().unwrap().new_file_number();
        self.pending_outputs.lock().unwrap().insert(file_number);

        compact.outputs.push(CompactionOutput {
            number: file_number,
            file_size: 0,
            smallest: InternalKey::default(),
            largest: InternalKey::default(),
        });

        let file = File::create(table_file_name(&self.path, file_number))?;
        compact.builder = Some(TableBuilder::new(self.options.clone(), file));
        Ok(())
    }

    fn finish_compaction_output_file(
        &self,
        compact: &mut CompactionState,
        input: &dyn Iter,
    ) -> Result<()> {
        let mut builder = compact.builder.take().expect("output builder open");
        let output_number = compact.current_output().number;
        debug_assert!(output_number != 0);

        let current_entries = builder.num_entries();
        let mut result = match input.status() {
            Ok(()) => builder.finish(),
            Err(e) => {
                builder.abandon();
                Err(e)
            }
        };
        if result.is_ok() {
            result = builder.sync();
        }
        let current_bytes = builder.file_size();
        compact.current_output().file_size = current_bytes;
        compact.total_bytes += current_bytes;
        drop(builder);

        if result.is_ok() && current_entries > 0 {
            // Verify the new table is usable before relying on it.
            let verify =
                self.table_cache
                    .iter(&ReadOptions::new(), output_number, current_bytes);
            result = verify.status();
            if result.is_ok() {
                info!(
                    file = output_number,
                    entries = current_entries,
                    bytes = current_bytes,
                    "generated compaction output"
                );
            }
        }
        result
    }

    fn install_compaction_results(&self, compact: &mut CompactionState) -> Result<()> {
        info!(
            inputs0 = compact.compaction.num_input_files(0),
            level = compact.compaction.level(),
            inputs1 = compact.compaction.num_input_files(1),
            bytes = compact.total_bytes,
            "installing compaction results"
        );
        compact.compaction.add_input_deletions();
        let level = compact.compaction.level();
        for output in &compact.outputs {
            compact.compaction.edit_mut().add_file(
                level + 1,
                output.number,
                output.file_size,
                output.smallest.clone(),
                output.largest.clone(),
            );
        }
        self.versions
            .lock()
            .unwrap()
            .log_and_apply(compact.compaction.edit_mut())
    }

    fn cleanup_compaction(&self, compact: &mut CompactionState) {
        if let Some(builder) = &mut compact.builder {
            builder.abandon();
            compact.builder = None;
        }
        let mut pending = self.pending_outputs.lock().unwrap();
        for output in &compact.outputs {
            pending.remove(&output.number);
        }
    }

    /// Merges the input files, applying the drop rules, and installs the
    /// outputs at level+1.
    fn do_compaction_work(&self, compact: &mut CompactionState) -> Result<()> {
        let start = Instant::now();
        info!(
            inputs0 = compact.compaction.num_input_files(0),
            level = compact.compaction.level(),
            inputs1 = compact.compaction.num_input_files(1),
            "compacting"
        );
        debug_assert!(compact.builder.is_none());
        debug_assert!(compact.outputs.is_empty());

        compact.smallest_snapshot = self
            .snapshots
            .oldest()
            .unwrap_or_else(|| self.versions.lock().unwrap().last_sequence());

        let mut input = self
            .versions
            .lock()
            .unwrap()
            .make_input_iterator(compact.compaction);
        input.seek_to_first();

        let ucmp = self.ucmp();
        let mut result = Ok(());
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = crate::key::MAX_SEQUENCE_NUMBER;

        while input.valid() && !self.shutting_down.load(Ordering::Acquire) {
            // A rotated memtable takes priority over this merge.
            if self.has_imm.load(Ordering::Acquire) {
                self.compact_memtable();
                self.signal_background_done();
            }

            let key = input.key().to_vec();
            if compact.compaction.should_stop_before(&key) && compact.builder.is_some() {
                result = self.finish_compaction_output_file(compact, input.as_ref());
                if result.is_err() {
                    break;
                }
            }

            let mut drop_entry = false;
            match crate::key::parse_internal_key(&key) {
                Err(_) => {
                    // Keep corrupted entries so operators can find them.
                    current_user_key = None;
                    last_sequence_for_key = crate::key::MAX_SEQUENCE_NUMBER;
                }
                Ok(ikey) => {
                    let first_occurrence = match &current_user_key {
                        None => true,
                        Some(k) => {
                            ucmp.compare(&ikey.user_key, k) != std::cmp::Ordering::Equal
                        }
                    };
                    if first_occurrence {
                        current_user_key = Some(ikey.user_key.clone());
                        last_sequence_for_key = crate::key::MAX_SEQUENCE_NUMBER;
                    }

                    if last_sequence_for_key <= compact.smallest_snapshot {
                        // A newer entry for this key at or below the
                        // horizon already shadows this one for everybody.
                        drop_entry = true;
                    } else if ikey.value_type == ValueType::Deletion
                        && ikey.sequence <= compact.smallest_snapshot
                        && compact.compaction.is_base_level_for_key(&ikey.user_key)
                    {
                        // Nothing below can be hidden by this tombstone.
                        drop_entry = true;
                    }
                    last_sequence_for_key = ikey.sequence;
                }
            }

            if !drop_entry {
                if compact.builder.is_none() {
                    result = self.open_compaction_output_file(compact);
                    if result.is_err() {
                        break;
                    }
                }
                if compact.builder.as_ref().unwrap().num_entries() == 0 {
                    compact.current_output().smallest = InternalKey::decode_from(&key)?;
                }
                compact.current_output().largest = InternalKey::decode_from(&key)?;
                result = compact.builder.as_mut().unwrap().add(&key, input.value());
                if result.is_err() {
                    break;
                }

                if compact.builder.as_ref().unwrap().file_size()
                    >= compact.compaction.max_output_file_size()
                {
                    result = self.finish_compaction_output_file(compact, input.as_ref());
                    if result.is_err() {
                        break;
                    }
                }
            }

            input.next();
        }

        if result.is_ok() && self.shutting_down.load(Ordering::Acquire) {
            result = Err(Error::Io("deleting db during compaction".to_string()));
        }
        if result.is_ok() && compact.builder.is_some() {
            result = self.finish_compaction_output_file(compact, input.as_ref());
        }
        if result.is_ok() {
            result = input.status();
        }
        drop(input);

        let mut stats = CompactionStats {
            micros: start.elapsed().as_micros() as u64,
            ..Default::default()
        };
        for which in 0..2 {
            for i in 0..compact.compaction.num_input_files(which) {
                stats.bytes_read += compact.compaction.input(which, i).size;
            }
        }
        for output in &compact.outputs {
            stats.bytes_written += output.file_size;
        }
        self.stats.lock().unwrap()[compact.compaction.level() + 1].add(stats);

        if result.is_ok() {
            result = self.install_compaction_results(compact);
        }
        info!(summary = %self.versions.lock().unwrap().level_summary(), "compacted");
        result
    }

    // ----- file GC --------------------------------------------------------

    /// Deletes files no live version, pending output, or WAL horizon still
    /// needs.
    fn remove_obsolete_files(&self) {
        if self.bg_error().is_some() {
            // A failed log_and_apply leaves the commit state of the newest
            // version unknown; garbage collecting now could eat its files.
            return;
        }

        let (live, log_number, prev_log_number, manifest_number) = {
            let mut versions = self.versions.lock().unwrap();
            let mut live = self.pending_outputs.lock().unwrap().clone();
            live.extend(versions.live_files());
            (
                live,
                versions.log_number(),
                versions.prev_log_number(),
                versions.manifest_file_number(),
            )
        };

        let entries = match std::fs::read_dir(&self.path) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((number, kind)) = parse_file_name(name) else {
                continue;
            };
            let keep = match kind {
                FileKind::Log => number >= log_number || number == prev_log_number,
                FileKind::Descriptor => number >= manifest_number,
                FileKind::Table => live.contains(&number),
                // Being written right now iff still in pending_outputs.
                FileKind::Temp => live.contains(&number),
                FileKind::Current | FileKind::Lock | FileKind::InfoLog => true,
            };
            if !keep {
                if kind == FileKind::Table {
                    self.table_cache.evict(number);
                }
                info!(file = name, "deleting obsolete file");
                let _ = std::fs::remove_file(self.path.join(name));
            }
        }
    }

    // ----- reads ----------------------------------------------------------

    fn get(&self, options: &ReadOptions, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snapshot = match &options.snapshot {
            Some(s) => s.sequence(),
            None => self.versions.lock().unwrap().last_sequence(),
        };

        let (mem, imm, current) = {
            let versions = self.versions.lock().unwrap();
            (
                self.mem.read().unwrap().clone(),
                self.imm.read().unwrap().clone(),
                versions.current(),
            )
        };

        let lookup_key = LookupKey::new(user_key, snapshot);

        if let Some(mem) = &mem {
            match mem.get(&lookup_key) {
                MemtableGet::Found(v) => return Ok(Some(v)),
                MemtableGet::Deleted => return Ok(None),
                MemtableGet::NotFound => {}
            }
        }
        if let Some(imm) = &imm {
            match imm.get(&lookup_key) {
                MemtableGet::Found(v) => return Ok(Some(v)),
                MemtableGet::Deleted => return Ok(None),
                MemtableGet::NotFound => {}
            }
        }

        let mut stats = None;
        let value = current.get(options, &lookup_key, &mut stats)?;
        if let Some(stats) = stats {
            if current.update_stats(&stats) {
                self.maybe_schedule_compaction();
            }
        }
        Ok(value)
    }

    /// Merging iterator over the memtables and the current version,
    /// together with the sequence it should read at and the version pin.
    fn new_internal_iterator(
        &self,
        options: &ReadOptions,
    ) -> (Box<dyn Iter>, SequenceNumber, Arc<Version>) {
        let (mem, imm, current, latest) = {
            let versions = self.versions.lock().unwrap();
            (
                self.mem.read().unwrap().clone(),
                self.imm.read().unwrap().clone(),
                versions.current(),
                versions.last_sequence(),
            )
        };

        let mut children: Vec<Box<dyn Iter>> = Vec::new();
        if let Some(mem) = &mem {
            children.push(Box::new(mem.iter()));
        }
        if let Some(imm) = &imm {
            children.push(Box::new(imm.iter()));
        }
        current.add_iterators(options, &mut children);

        let merged = MergingIterator::new(self.icmp.clone(), children);
        (merged, latest, current)
    }

    // ----- manual compaction ----------------------------------------------

    /// Blocks until queued writes drain and any immutable memtable is
    /// flushed.
    fn wait_for_memtable_flush(&self, done: Receiver<Result<()>>) -> Result<()> {
        match done.recv() {
            Ok(r) => r?,
            Err(_) => return Err(Error::Io("database closed".to_string())),
        }
        let mut bg = self.bg.lock().unwrap();
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::Io("database closed".to_string()));
            }
            if let Some(e) = &bg.error {
                return Err(e.clone());
            }
            if !self.has_imm.load(Ordering::Acquire) {
                return Ok(());
            }
            bg = self.bg_cv.wait(bg).unwrap();
        }
    }

    /// Runs manual compaction rounds for one level until the range is
    /// exhausted.
    fn manual_compact_level(&self, level: usize, begin: Option<&[u8]>, end: Option<&[u8]>) {
        debug_assert!(level + 1 < NUM_LEVELS);
        let manual = Arc::new(Mutex::new(ManualCompaction {
            level,
            begin: begin
                .map(|b| InternalKey::new(b, crate::key::MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK)),
            end: end.map(|e| InternalKey::new(e, 0, ValueType::Deletion)),
            done: false,
        }));

        while !manual.lock().unwrap().done
            && !self.shutting_down.load(Ordering::Acquire)
            && self.bg_error().is_none()
        {
            let mut bg = self.bg.lock().unwrap();
            if bg.manual.is_none() {
                bg.manual = Some(Arc::clone(&manual));
                drop(bg);
                self.maybe_schedule_compaction();
            } else {
                // Another manual (or this one) is running; wait a round.
                let _unused = self.bg_cv.wait(bg).unwrap();
            }
        }

        // If we bailed early, never leave our request armed.
        let mut bg = self.bg.lock().unwrap();
        if let Some(m) = &bg.manual {
            if Arc::ptr_eq(m, &manual) {
                bg.manual = None;
            }
        }
    }
}

/// An embedded, single-writer, ordered key-value store.
pub struct DB {
    inner: Arc<DbInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB").finish_non_exhaustive()
    }
}

impl DB {
    /// Opens (optionally creating) the database at `path`.
    pub fn open(options: Options, path: impl AsRef<Path>) -> Result<DB> {
        let path = path.as_ref().to_path_buf();
        let options = options.sanitize();
        let icmp = InternalKeyComparator::new(options.comparator.clone());

        std::fs::create_dir_all(&path)?;
        let lock = FileLock::lock(lock_file_name(&path))
            .map_err(|e| Error::Io(format!("lock {}: {e}", path.display())))?;

        let block_cache = Arc::new(ShardedCache::new(options.block_cache_capacity));
        let table_cache = Arc::new(TableCache::new(
            path.clone(),
            options.clone(),
            Arc::clone(&block_cache),
            options.max_open_files - NUM_NON_TABLE_CACHE_FILES,
        ));
        let versions = VersionSet::new(path.clone(), options.clone(), Arc::clone(&table_cache));

        let inner = Arc::new(DbInner {
            path,
            options,
            icmp,
            table_cache,
            block_cache,
            mem: RwLock::new(None),
            imm: RwLock::new(None),
            has_imm: AtomicBool::new(false),
            wal: Mutex::new(None),
            wal_number: AtomicU64::new(0),
            versions: Mutex::new(versions),
            writers: Mutex::new(VecDeque::new()),
            write_wake: unbounded(),
            compact_wake: unbounded(),
            bg: Mutex::new(BgState {
                compaction_scheduled: false,
                error: None,
                manual: None,
            }),
            bg_cv: Condvar::new(),
            pending_outputs: Mutex::new(HashSet::new()),
            snapshots: SnapshotList::new(),
            shutting_down: AtomicBool::new(false),
            stats: Mutex::new([CompactionStats::default(); NUM_LEVELS]),
            iter_seed: AtomicU64::new(0),
            _lock: Mutex::new(Some(lock)),
        });

        let mut edit = VersionEdit::new();
        let save_manifest = Self::recover(&inner, &mut edit)?;

        // A fresh memtable and WAL unless recovery reused the last ones.
        if inner.mem.read().unwrap().is_none() {
            let new_log_number = inner.versions.lock().unwrap().new_file_number();
            let file = File::create(log_file_name(&inner.path, new_log_number))?;
            *inner.wal.lock().unwrap() = Some(LogWriter::new(file));
            inner.wal_number.store(new_log_number, Ordering::Release);
            *inner.mem.write().unwrap() = Some(Arc::new(MemTable::new(inner.icmp.clone())));
            edit.set_log_number(new_log_number);
        }

        if save_manifest {
            edit.set_prev_log_number(0);
            edit.set_log_number(inner.wal_number.load(Ordering::Acquire));
            inner.versions.lock().unwrap().log_and_apply(&mut edit)?;
        }

        inner.remove_obsolete_files();

        let db = DB {
            inner: Arc::clone(&inner),
            workers: Mutex::new(Vec::new()),
        };
        db.start_workers();
        inner.maybe_schedule_compaction();
        info!(path = %inner.path.display(), "database opened");
        Ok(db)
    }

    fn start_workers(&self) {
        let mut workers = self.workers.lock().unwrap();

        let write_inner = Arc::clone(&self.inner);
        workers.push(
            std::thread::Builder::new()
                .name("emberdb-write".to_string())
                .spawn(move || write_inner.write_worker())
                .expect("spawn write worker"),
        );

        let compact_inner = Arc::clone(&self.inner);
        workers.push(
            std::thread::Builder::new()
                .name("emberdb-compact".to_string())
                .spawn(move || compact_inner.background_worker())
                .expect("spawn background worker"),
        );
    }

    /// Creates the initial manifest and CURRENT for a brand-new database.
    fn new_db(inner: &DbInner) -> Result<()> {
        info!(path = %inner.path.display(), "creating new database");
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(inner.icmp.name());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let manifest = descriptor_file_name(&inner.path, 1);
        let file = File::create(&manifest)?;
        let mut log = LogWriter::new(file);
        let mut record = Vec::new();
        edit.encode_to(&mut record);
        let result = log.add_record(&record).and_then(|_| log.sync());
        match result {
            Ok(()) => set_current_file(&inner.path, 1),
            Err(e) => {
                let _ = std::fs::remove_file(&manifest);
                Err(e)
            }
        }
    }

    /// Recovers version state and replays WALs newer than the manifest's
    /// horizon. Returns whether a manifest write is still owed.
    fn recover(inner: &Arc<DbInner>, edit: &mut VersionEdit) -> Result<bool> {
        if !current_file_name(&inner.path).exists() {
            if !inner.options.create_if_missing {
                return Err(Error::NotFound(format!(
                    "{}: does not exist (create_if_missing is false)",
                    inner.path.display()
                )));
            }
            Self::new_db(inner)?;
        } else if inner.options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "{}: exists (error_if_exists is true)",
                inner.path.display()
            )));
        }

        let mut save_manifest = inner.versions.lock().unwrap().recover()?;

        // Any log at or past the manifest horizon (plus the previous log,
        // which may still back an unflushed memtable) must be replayed.
        let (min_log, prev_log) = {
            let versions = inner.versions.lock().unwrap();
            (versions.log_number(), versions.prev_log_number())
        };
        let mut expected = inner.versions.lock().unwrap().live_files();
        let mut logs = Vec::new();
        for entry in std::fs::read_dir(&inner.path)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((number, kind)) = parse_file_name(name) {
                expected.remove(&number);
                if kind == FileKind::Log && (number >= min_log || number == prev_log) {
                    logs.push(number);
                }
            }
        }
        if !expected.is_empty() {
            return Err(crate::corruption!(
                "{} missing table files (e.g. {:06})",
                expected.len(),
                expected.iter().next().unwrap()
            ));
        }

        logs.sort_unstable();
        let mut max_sequence = 0;
        for (i, &log_number) in logs.iter().enumerate() {
            let last_log = i + 1 == logs.len();
            save_manifest |= Self::recover_log_file(
                inner,
                log_number,
                last_log,
                edit,
                &mut max_sequence,
            )?;
            // The failed process may have allocated this number without
            // recording it in the manifest.
            inner.versions.lock().unwrap().mark_file_number_used(log_number);
        }

        {
            let mut versions = inner.versions.lock().unwrap();
            if versions.last_sequence() < max_sequence {
                versions.set_last_sequence(max_sequence);
            }
        }
        Ok(save_manifest)
    }

    /// Replays one WAL into memtables, flushing to level-0 whenever one
    /// fills. Returns whether this produced manifest-worthy changes.
    fn recover_log_file(
        inner: &Arc<DbInner>,
        log_number: u64,
        last_log: bool,
        edit: &mut VersionEdit,
        max_sequence: &mut SequenceNumber,
    ) -> Result<bool> {
        info!(log = log_number, "recovering write-ahead log");
        let path = log_file_name(&inner.path, log_number);
        let file = File::open(&path)?;
        let mut reader = LogReader::new(file, inner.options.paranoid_checks);

        let mut save_manifest = false;
        let mut compactions = 0;
        let mut mem: Option<Arc<MemTable>> = None;
        let mut batch = WriteBatch::new();

        while let Some(record) = reader.read_record()? {
            if record.len() < 12 {
                warn!(log = log_number, bytes = record.len(), "log record too small");
                continue;
            }
            batch.set_contents(&record)?;
            let mem_ref = mem
                .get_or_insert_with(|| Arc::new(MemTable::new(inner.icmp.clone())));
            batch.insert_into(mem_ref)?;

            let last_seq = batch.sequence() + batch.count() as u64 - 1;
            if last_seq > *max_sequence {
                *max_sequence = last_seq;
            }

            if mem_ref.approximate_memory_usage() > inner.options.write_buffer_size {
                compactions += 1;
                save_manifest = true;
                inner.write_level0_table(mem_ref, edit, None)?;
                mem = None;
            }
        }

        if inner.options.reuse_logs && last_log && compactions == 0 {
            // Keep appending to this WAL; its memtable stays active.
            debug_assert!(inner.wal.lock().unwrap().is_none());
            let size = std::fs::metadata(&path)?.len();
            let log_file = std::fs::OpenOptions::new().append(true).open(&path)?;
            *inner.wal.lock().unwrap() = Some(LogWriter::with_offset(log_file, size));
            inner.wal_number.store(log_number, Ordering::Release);
            info!(log = log_number, bytes = size, "reusing write-ahead log");
            *inner.mem.write().unwrap() = Some(
                mem.take()
                    .unwrap_or_else(|| Arc::new(MemTable::new(inner.icmp.clone()))),
            );
        }

        if let Some(mem) = mem {
            save_manifest = true;
            inner.write_level0_table(&mem, edit, None)?;
        }
        Ok(save_manifest)
    }

    // ----- public API -----------------------------------------------------

    pub fn put(&self, options: WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    pub fn delete(&self, options: WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    /// Applies `batch` atomically. An empty batch waits for earlier writes
    /// to land and forces a memtable rotation.
    pub fn write(&self, options: WriteOptions, batch: WriteBatch) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(Error::Io("database closed".to_string()));
        }
        let (tx, rx) = bounded(1);
        self.inner.writers.lock().unwrap().push_back(Writer {
            batch,
            sync: options.sync,
            done: tx,
        });
        self.inner
            .write_wake
            .0
            .send(())
            .map_err(|_| Error::Io("database closed".to_string()))?;
        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::Io("database closed".to_string())),
        }
    }

    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(options, key)
    }

    /// Ordered iterator over the whole database as of now (or of the
    /// read options' snapshot).
    pub fn new_iterator(&self, options: &ReadOptions) -> DbIterator {
        let (inner_iter, latest, version) = self.inner.new_internal_iterator(options);
        let sequence = match &options.snapshot {
            Some(s) => s.sequence(),
            None => latest,
        };
        let seed = self.inner.iter_seed.fetch_add(1, Ordering::Relaxed);
        DbIterator::new(Arc::clone(&self.inner), inner_iter, sequence, version, seed)
    }

    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        let seq = self.inner.versions.lock().unwrap().last_sequence();
        self.inner.snapshots.create(seq)
    }

    /// Releases a snapshot handle. Dropping the handle has the same
    /// effect; this exists for symmetry with `get_snapshot`.
    pub fn release_snapshot(&self, snapshot: Arc<Snapshot>) {
        drop(snapshot);
    }

    /// Engine introspection. Returns `None` for unknown property names.
    pub fn get_property(&self, name: &str) -> Option<String> {
        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(
                self.inner
                    .versions
                    .lock()
                    .unwrap()
                    .num_level_files(level)
                    .to_string(),
            );
        }
        match name {
            "stats" => {
                let mut out = String::from(
                    "Compactions\n\
                     Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                let stats = self.inner.stats.lock().unwrap();
                let versions = self.inner.versions.lock().unwrap();
                for level in 0..NUM_LEVELS {
                    let files = versions.num_level_files(level);
                    let s = stats[level];
                    if s.micros > 0 || files > 0 {
                        out.push_str(&format!(
                            "{:>5} {:>6} {:>8.0} {:>9.3} {:>8.3} {:>9.3}\n",
                            level,
                            files,
                            versions.num_level_bytes(level) as f64 / 1048576.0,
                            s.micros as f64 / 1e6,
                            s.bytes_read as f64 / 1048576.0,
                            s.bytes_written as f64 / 1048576.0,
                        ));
                    }
                }
                Some(out)
            }
            "sstables" => {
                let versions = self.inner.versions.lock().unwrap();
                let current = versions.current();
                let mut out = String::new();
                for (level, files) in current.files.iter().enumerate() {
                    out.push_str(&format!("--- level {level} ---\n"));
                    for f in files {
                        out.push_str(&format!(
                            "{}:{}[{:?} .. {:?}]\n",
                            f.number,
                            f.size,
                            f.smallest.user_key(),
                            f.largest.user_key()
                        ));
                    }
                }
                Some(out)
            }
            "approximate-memory-usage" => {
                let mut total = self.inner.block_cache.total_charge();
                if let Some(mem) = self.inner.mem.read().unwrap().as_ref() {
                    total += mem.approximate_memory_usage();
                }
                if let Some(imm) = self.inner.imm.read().unwrap().as_ref() {
                    total += imm.approximate_memory_usage();
                }
                Some(total.to_string())
            }
            _ => None,
        }
    }

    /// Approximate on-disk bytes spanned by each `[start, limit)` range.
    pub fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let versions = self.inner.versions.lock().unwrap();
        let current = versions.current();
        ranges
            .iter()
            .map(|(start, limit)| {
                let k1 = InternalKey::new(start, crate::key::MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let k2 = InternalKey::new(limit, crate::key::MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
                let start_off = versions.approximate_offset_of(&current, &k1);
                let limit_off = versions.approximate_offset_of(&current, &k2);
                limit_off.saturating_sub(start_off)
            })
            .collect()
    }

    /// Compacts every level overlapping `[begin, end]` down to the level
    /// below the deepest one holding matching data. `None` bounds are
    /// unbounded.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let mut max_level_with_files = 1;
        {
            let versions = self.inner.versions.lock().unwrap();
            let current = versions.current();
            for level in 1..NUM_LEVELS {
                if current.overlap_in_level(level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }

        // Flush current memtable contents first so they participate.
        let (tx, rx) = bounded(1);
        self.inner.writers.lock().unwrap().push_back(Writer {
            batch: WriteBatch::new(),
            sync: false,
            done: tx,
        });
        self.inner
            .write_wake
            .0
            .send(())
            .map_err(|_| Error::Io("database closed".to_string()))?;
        self.inner.wait_for_memtable_flush(rx)?;

        for level in 0..max_level_with_files {
            self.inner.manual_compact_level(level, begin, end);
        }
        if let Some(e) = self.inner.bg_error() {
            return Err(e);
        }
        Ok(())
    }

    /// Deletes every file of the database at `path`. The database must
    /// not be open. A missing directory is not an error.
    pub fn destroy_db(path: impl AsRef<Path>, _options: Options) -> Result<()> {
        let path = path.as_ref();
        let entries = match std::fs::read_dir(path) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let lock = FileLock::lock(lock_file_name(path))
            .map_err(|e| Error::Io(format!("lock {}: {e}", path.display())))?;
        let mut result = Ok(());
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((_, kind)) = parse_file_name(name) else {
                continue;
            };
            if kind == FileKind::Lock {
                continue; // deleted last
            }
            if let Err(e) = std::fs::remove_file(path.join(name)) {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        drop(lock);
        let _ = std::fs::remove_file(lock_file_name(path));
        let _ = std::fs::remove_dir(path);
        result
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        // Wake both workers so they observe the flag and exit; anyone
        // parked on the background condvar (a stalled write, a manual
        // compaction) must also re-check the flag. Then wait for in-flight
        // background work to wind down.
        let _ = self.inner.write_wake.0.send(());
        let _ = self.inner.compact_wake.0.send(());
        self.inner.signal_background_done();
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        self.inner.fail_queued_writers();
        info!(path = %self.inner.path.display(), "database closed");
    }
}
