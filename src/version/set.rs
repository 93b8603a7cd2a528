//! The version set: file-number allocation, the manifest, and compaction
//! selection.
//!
//! Exactly one version is "current"; older versions stay alive only while
//! an iterator, read, or compaction still holds their `Arc`. Every change
//! to the file set flows through `log_and_apply`, which appends the edit
//! to the manifest before installing the successor version.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tracing::{error, info};

use crate::comparator::InternalKeyComparator;
use crate::config::{
    expanded_compaction_byte_size_limit, max_grand_parent_overlap_bytes, Options, ReadOptions,
    NUM_LEVELS,
};
use crate::db::filename::{
    descriptor_file_name, read_current_file, set_current_file, parse_file_name, FileKind,
};
use crate::error::{Error, Result};
use crate::iterator::{Iter, MergingIterator};
use crate::key::{InternalKey, SequenceNumber};
use crate::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::{finalize, FileMetaData, LevelFileNumIterator, Version};
use crate::wal::{LogReader, LogWriter};

/// Accumulates edits on top of a base version.
struct Builder {
    deleted: [HashSet<u64>; NUM_LEVELS],
    added: [Vec<Arc<FileMetaData>>; NUM_LEVELS],
}

impl Builder {
    fn new() -> Self {
        Self {
            deleted: Default::default(),
            added: Default::default(),
        }
    }

    /// Folds one edit in; compact pointers land in the version set.
    fn apply(&mut self, edit: &VersionEdit, compact_pointer: &mut [Vec<u8>; NUM_LEVELS]) {
        for (level, key) in &edit.compact_pointers {
            compact_pointer[*level] = key.encoded().to_vec();
        }
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
        }
        for f in &edit.new_files {
            let meta = Arc::new(FileMetaData::new(
                f.number,
                f.size,
                f.smallest.clone(),
                f.largest.clone(),
            ));
            self.deleted[f.level].remove(&f.number);
            self.added[f.level].push(meta);
        }
    }

    /// Produces the successor version from `base`.
    fn save_to(self, base: &Version, icmp: &InternalKeyComparator, mut v: Version) -> Version {
        for (level, added) in self.added.into_iter().enumerate() {
            let deleted = &self.deleted[level];
            let mut files: Vec<Arc<FileMetaData>> = base.files[level]
                .iter()
                .filter(|f| !deleted.contains(&f.number))
                .cloned()
                .chain(added.into_iter().filter(|f| !deleted.contains(&f.number)))
                .collect();
            files.sort_by(|a, b| icmp.compare(a.smallest.encoded(), b.smallest.encoded()));

            #[cfg(debug_assertions)]
            if level > 0 {
                for pair in files.windows(2) {
                    debug_assert!(
                        icmp.compare(pair[0].largest.encoded(), pair[1].smallest.encoded())
                            == Ordering::Less,
                        "overlapping files installed at level {level}"
                    );
                }
            }
            v.files[level] = files;
        }
        v
    }
}

pub struct VersionSet {
    db_path: PathBuf,
    options: Options,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    /// WAL holding mutations not yet reflected in a table file.
    log_number: u64,
    /// WAL of the immutable memtable still awaiting flush (0 = none).
    prev_log_number: u64,

    descriptor_log: Option<LogWriter>,
    current: Arc<Version>,
    /// Versions that may still be pinned by readers; pruned lazily.
    live: Vec<Weak<Version>>,

    /// Largest internal key compacted at each level, for round-robin
    /// compaction selection.
    compact_pointer: [Vec<u8>; NUM_LEVELS],
}

impl VersionSet {
    pub fn new(db_path: PathBuf, options: Options, table_cache: Arc<TableCache>) -> Self {
        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let mut v = Version::new(icmp.clone(), Arc::clone(&table_cache), options.clone());
        finalize(&mut v);
        Self {
            db_path,
            options,
            icmp,
            table_cache,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            descriptor_log: None,
            current: Arc::new(v),
            live: Vec::new(),
            compact_pointer: Default::default(),
        }
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Returns an abandoned file number to the allocator, but only when it
    /// is still the most recently issued one.
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, s: SequenceNumber) {
        debug_assert!(s >= self.last_sequence);
        self.last_sequence = s;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        self.current.level_bytes(level)
    }

    /// Applies `edit`, appends it to the manifest, and installs the result
    /// as the current version. On the first call after open this also
    /// creates the manifest and seeds it with a snapshot of current state.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            Some(n) => {
                debug_assert!(n >= self.log_number && n < self.next_file_number);
            }
            None => edit.set_log_number(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut builder = Builder::new();
        builder.apply(edit, &mut self.compact_pointer);
        let mut v = builder.save_to(
            &self.current,
            &self.icmp,
            Version::new(
                self.icmp.clone(),
                Arc::clone(&self.table_cache),
                self.options.clone(),
            ),
        );
        finalize(&mut v);

        let mut created_manifest = false;
        if self.descriptor_log.is_none() {
            let path = descriptor_file_name(&self.db_path, self.manifest_file_number);
            let file = File::create(&path)?;
            let mut log = LogWriter::new(file);
            let snapshot = self.snapshot_edit();
            let mut record = Vec::new();
            snapshot.encode_to(&mut record);
            if let Err(e) = log.add_record(&record) {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
            self.descriptor_log = Some(log);
            created_manifest = true;
        }

        let mut record = Vec::new();
        edit.encode_to(&mut record);
        let log = self.descriptor_log.as_mut().unwrap();
        let result = log.add_record(&record).and_then(|_| log.sync());

        let result = match result {
            Ok(()) if created_manifest => {
                set_current_file(&self.db_path, self.manifest_file_number)
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.log_number = edit.log_number.unwrap();
                self.prev_log_number = edit.prev_log_number.unwrap();
                self.current = Arc::new(v);
                self.live.push(Arc::downgrade(&self.current));
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "manifest append failed");
                if created_manifest {
                    self.descriptor_log = None;
                    let _ = std::fs::remove_file(descriptor_file_name(
                        &self.db_path,
                        self.manifest_file_number,
                    ));
                }
                Err(e)
            }
        }
    }

    /// One edit capturing the entire current state, written as the first
    /// record of every new manifest.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.name());
        for (level, ptr) in self.compact_pointer.iter().enumerate() {
            if !ptr.is_empty() {
                if let Ok(key) = InternalKey::decode_from(ptr) {
                    edit.set_compact_pointer(level, key);
                }
            }
        }
        for (level, files) in self.current.files.iter().enumerate() {
            for f in files {
                edit.add_file(level, f.number, f.size, f.smallest.clone(), f.largest.clone());
            }
        }
        edit
    }

    /// Rebuilds state from `CURRENT` and the manifest it names. Returns
    /// whether a fresh manifest must be written (`true`), or the old one
    /// was reused for appending (`false`).
    pub fn recover(&mut self) -> Result<bool> {
        let manifest_name = read_current_file(&self.db_path)?;
        let manifest_path = self.db_path.join(&manifest_name);
        let manifest_size = std::fs::metadata(&manifest_path)?.len();
        let file = File::open(&manifest_path)?;

        // Manifest damage is never skippable; replay in paranoid mode.
        let mut reader = LogReader::new(file, true);
        let mut builder = Builder::new();
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode_from(&record)?;
            if let Some(name) = &edit.comparator_name {
                if name != self.icmp.name() {
                    return Err(Error::InvalidArgument(format!(
                        "comparator mismatch: db uses {name}, options supply {}",
                        self.icmp.name()
                    )));
                }
            }
            builder.apply(&edit, &mut self.compact_pointer);
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        let next_file_number =
            next_file_number.ok_or_else(|| crate::corruption!("manifest missing next-file entry"))?;
        let log_number =
            log_number.ok_or_else(|| crate::corruption!("manifest missing log-number entry"))?;
        let last_sequence = last_sequence
            .ok_or_else(|| crate::corruption!("manifest missing last-sequence entry"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.next_file_number = next_file_number;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);

        let mut v = builder.save_to(
            &self.current,
            &self.icmp,
            Version::new(
                self.icmp.clone(),
                Arc::clone(&self.table_cache),
                self.options.clone(),
            ),
        );
        finalize(&mut v);
        self.current = Arc::new(v);
        self.live.push(Arc::downgrade(&self.current));

        if self.reuse_manifest(&manifest_path, &manifest_name, manifest_size) {
            info!(manifest = %manifest_name, "reusing manifest");
            Ok(false)
        } else {
            self.manifest_file_number = self.new_file_number();
            Ok(true)
        }
    }

    fn reuse_manifest(&mut self, path: &std::path::Path, name: &str, size: u64) -> bool {
        if !self.options.reuse_logs {
            return false;
        }
        let Some((number, FileKind::Descriptor)) = parse_file_name(name) else {
            return false;
        };
        if size >= self.options.max_file_size {
            // Compact the manifest on the next open instead of growing it
            // without bound.
            return false;
        }
        let file = match OpenOptions::new().append(true).open(path) {
            Ok(f) => f,
            Err(_) => return false,
        };
        self.descriptor_log = Some(LogWriter::with_offset(file, size));
        self.manifest_file_number = number;
        self.mark_file_number_used(number);
        true
    }

    /// Table files referenced by any still-reachable version.
    pub fn live_files(&mut self) -> HashSet<u64> {
        self.live.retain(|w| w.strong_count() > 0);
        let mut live = HashSet::new();
        for v in self.live.iter().filter_map(|w| w.upgrade()) {
            for files in &v.files {
                live.extend(files.iter().map(|f| f.number));
            }
        }
        for files in &self.current.files {
            live.extend(files.iter().map(|f| f.number));
        }
        live
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0 || self.current.file_to_compact().is_some()
    }

    fn range(&self, inputs: &[Arc<FileMetaData>]) -> (InternalKey, InternalKey) {
        debug_assert!(!inputs.is_empty());
        let mut smallest = inputs[0].smallest.clone();
        let mut largest = inputs[0].largest.clone();
        for f in &inputs[1..] {
            if self.icmp.compare(f.smallest.encoded(), smallest.encoded()) == Ordering::Less {
                smallest = f.smallest.clone();
            }
            if self.icmp.compare(f.largest.encoded(), largest.encoded()) == Ordering::Greater {
                largest = f.largest.clone();
            }
        }
        (smallest, largest)
    }

    fn range2(
        &self,
        a: &[Arc<FileMetaData>],
        b: &[Arc<FileMetaData>],
    ) -> (InternalKey, InternalKey) {
        let all: Vec<Arc<FileMetaData>> = a.iter().chain(b.iter()).cloned().collect();
        self.range(&all)
    }

    /// Picks the next compaction: size-triggered first, then
    /// seek-triggered. Returns `None` when nothing needs doing.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();

        let mut c;
        if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);
            // Round-robin within the level: first file past the last
            // compact pointer, wrapping to the start.
            let mut chosen = None;
            for f in &current.files[level] {
                if self.compact_pointer[level].is_empty()
                    || self
                        .icmp
                        .compare(f.largest.encoded(), &self.compact_pointer[level])
                        == Ordering::Greater
                {
                    chosen = Some(Arc::clone(f));
                    break;
                }
            }
            let chosen = chosen.or_else(|| current.files[level].first().cloned())?;
            c = Compaction::new(&self.options, level);
            c.inputs[0].push(chosen);
        } else if let Some((file, level)) = current.file_to_compact() {
            c = Compaction::new(&self.options, level);
            c.inputs[0].push(file);
        } else {
            return None;
        }

        c.input_version = Some(Arc::clone(&current));

        // Level-0 inputs may overlap each other; widen to cover them all.
        if c.level == 0 {
            let (smallest, largest) = self.range(&c.inputs[0]);
            let mut inputs = Vec::new();
            current.get_overlapping_inputs(0, Some(&smallest), Some(&largest), &mut inputs);
            debug_assert!(!inputs.is_empty());
            c.inputs[0] = inputs;
        }

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Builds a manual compaction for `[begin, end]` at `level`, bounding
    /// the input volume for levels > 0.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = Vec::new();
        current.get_overlapping_inputs(level, begin, end, &mut inputs);
        if inputs.is_empty() {
            return None;
        }

        if level > 0 {
            // One shot should not rewrite the whole level.
            let limit = self.options.max_file_size;
            let mut total = 0;
            for (i, f) in inputs.iter().enumerate() {
                total += f.size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(&self.options, level);
        c.input_version = Some(current);
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Completes a compaction descriptor: boundary extension, level+1
    /// inputs, opportunistic expansion, grandparents, compact pointer.
    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let current = c.input_version.as_ref().unwrap().clone();
        let level = c.level;

        add_boundary_inputs(&self.icmp, &current.files[level], &mut c.inputs[0]);
        let (smallest, largest) = self.range(&c.inputs[0]);

        current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest), &mut c.inputs[1]);
        add_boundary_inputs(&self.icmp, &current.files[level + 1], &mut c.inputs[1]);

        let (mut all_start, mut all_limit) = self.range2(&c.inputs[0], &c.inputs[1]);
        let mut largest = largest;

        // Try to grow the level-L side while the level-(L+1) side stays
        // fixed and the total stays within budget.
        if !c.inputs[1].is_empty() {
            let mut expanded0 = Vec::new();
            current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit), &mut expanded0);
            add_boundary_inputs(&self.icmp, &current.files[level], &mut expanded0);

            let inputs1_size: u64 = c.inputs[1].iter().map(|f| f.size).sum();
            let expanded0_size: u64 = expanded0.iter().map(|f| f.size).sum();
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size < expanded_compaction_byte_size_limit(&self.options)
            {
                let (new_start, new_limit) = self.range(&expanded0);
                let mut expanded1 = Vec::new();
                current.get_overlapping_inputs(
                    level + 1,
                    Some(&new_start),
                    Some(&new_limit),
                    &mut expanded1,
                );
                add_boundary_inputs(&self.icmp, &current.files[level + 1], &mut expanded1);
                if expanded1.len() == c.inputs[1].len() {
                    info!(
                        level,
                        from_files = c.inputs[0].len(),
                        to_files = expanded0.len(),
                        "expanding compaction inputs"
                    );
                    largest = new_limit;
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let r = self.range2(&c.inputs[0], &c.inputs[1]);
                    all_start = r.0;
                    all_limit = r.1;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            current.get_overlapping_inputs(
                level + 2,
                Some(&all_start),
                Some(&all_limit),
                &mut c.grandparents,
            );
        }

        // Future compactions of this level resume past this run, even if
        // this one fails partway.
        self.compact_pointer[level] = largest.encoded().to_vec();
        c.edit.set_compact_pointer(level, largest);
    }

    /// Merging iterator over all compaction inputs.
    pub fn make_input_iterator(&self, c: &Compaction) -> Box<dyn Iter> {
        let options = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        let mut list: Vec<Box<dyn Iter>> = Vec::new();
        for which in 0..2 {
            if c.inputs[which].is_empty() {
                continue;
            }
            if c.level + which == 0 {
                for f in &c.inputs[0] {
                    list.push(self.table_cache.iter(&options, f.number, f.size));
                }
            } else {
                let index = LevelFileNumIterator::new(self.icmp.clone(), c.inputs[which].clone());
                let table_cache = Arc::clone(&self.table_cache);
                let options = options.clone();
                list.push(crate::table::TwoLevelIterator::new(
                    Box::new(index),
                    Box::new(move |file_value| {
                        if file_value.len() != 16 {
                            return Box::new(crate::iterator::EmptyIterator::with_error(
                                crate::corruption!("bad file entry in compaction input"),
                            ));
                        }
                        let number = crate::encoding::decode_fixed64(&file_value[0..8]);
                        let size = crate::encoding::decode_fixed64(&file_value[8..16]);
                        table_cache.iter(&options, number, size)
                    }),
                ));
            }
        }
        MergingIterator::new(self.icmp.clone(), list)
    }

    /// Approximate byte offset of `ikey` within the whole database as of
    /// version `v`.
    pub fn approximate_offset_of(&self, v: &Arc<Version>, ikey: &InternalKey) -> u64 {
        let mut result = 0;
        for (level, files) in v.files.iter().enumerate() {
            for f in files {
                if self.icmp.compare(f.largest.encoded(), ikey.encoded()) != Ordering::Greater {
                    // Entirely before ikey.
                    result += f.size;
                } else if self.icmp.compare(f.smallest.encoded(), ikey.encoded())
                    == Ordering::Greater
                {
                    // Entirely after.
                    if level > 0 {
                        break; // disjoint and sorted: nothing further counts
                    }
                } else {
                    result += self
                        .table_cache
                        .approximate_offset_of(f.number, f.size, ikey.encoded());
                }
            }
        }
        result
    }

    /// Per-level file counts for the info log.
    pub fn level_summary(&self) -> String {
        self.current.level_summary()
    }
}

/// Largest key in `files`, if any.
fn find_largest_key(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
) -> Option<InternalKey> {
    let mut largest: Option<&InternalKey> = None;
    for f in files {
        match largest {
            None => largest = Some(&f.largest),
            Some(l) => {
                if icmp.compare(f.largest.encoded(), l.encoded()) == Ordering::Greater {
                    largest = Some(&f.largest);
                }
            }
        }
    }
    largest.cloned()
}

/// The file in `level_files` whose smallest key is the least key greater
/// than `largest_key` while sharing its user key.
fn find_smallest_boundary_file(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    largest_key: &InternalKey,
) -> Option<Arc<FileMetaData>> {
    let ucmp = icmp.user_comparator();
    let mut best: Option<&Arc<FileMetaData>> = None;
    for f in level_files {
        if icmp.compare(f.smallest.encoded(), largest_key.encoded()) == Ordering::Greater
            && ucmp.compare(f.smallest.user_key(), largest_key.user_key()) == Ordering::Equal
        {
            match best {
                None => best = Some(f),
                Some(b) => {
                    if icmp.compare(f.smallest.encoded(), b.smallest.encoded()) == Ordering::Less {
                        best = Some(f);
                    }
                }
            }
        }
    }
    best.cloned()
}

/// Extends `compaction_files` with boundary files: entries for one user
/// key must never be split between the compacted set and the files left
/// behind, or an older version could surface after the newer one moves
/// down a level.
fn add_boundary_inputs(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetaData>],
    compaction_files: &mut Vec<Arc<FileMetaData>>,
) {
    let Some(mut largest_key) = find_largest_key(icmp, compaction_files) else {
        return;
    };
    while let Some(boundary) = find_smallest_boundary_file(icmp, level_files, &largest_key) {
        largest_key = boundary.largest.clone();
        compaction_files.push(boundary);
    }
}

/// Descriptor of one compaction job.
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    grandparent_overlap_limit: u64,
    pub(crate) input_version: Option<Arc<Version>>,
    pub(crate) edit: VersionEdit,
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    grandparents: Vec<Arc<FileMetaData>>,

    // State for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Monotonic cursors for is_base_level_for_key.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    fn new(options: &Options, level: usize) -> Self {
        Self {
            level,
            max_output_file_size: options.max_file_size,
            grandparent_overlap_limit: max_grand_parent_overlap_bytes(options),
            input_version: None,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    pub fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// A single input file with nothing to merge against and little
    /// grandparent overlap can be relabeled to the next level untouched.
    pub fn is_trivial_move(&self) -> bool {
        let grandparent_bytes: u64 = self.grandparents.iter().map(|f| f.size).sum();
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && grandparent_bytes <= self.grandparent_overlap_limit
    }

    /// Records deletion of every input file in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for f in &self.inputs[which] {
                self.edit.delete_file(self.level + which, f.number);
            }
        }
    }

    /// True when no level deeper than the output level contains
    /// `user_key`. Cursors only move forward, so the total cost across a
    /// whole compaction is linear in the file counts.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let version = self.input_version.as_ref().unwrap();
        let ucmp = version.icmp.user_comparator();
        for level in (self.level + 2)..NUM_LEVELS {
            let files = &version.files[level];
            while self.level_ptrs[level] < files.len() {
                let f = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater {
                    if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Whether the current output should be closed before `internal_key`
    /// to bound how much of level+2 a future compaction must touch.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        let version = self.input_version.as_ref().unwrap();
        let icmp = &version.icmp;
        while self.grandparent_index < self.grandparents.len()
            && icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encoded(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.grandparent_overlap_limit {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// Drops the pinned version once the compaction is over.
    pub fn release_inputs(&mut self) {
        self.input_version = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::ValueType;
    use crate::cache::ShardedCache;
    use tempfile::TempDir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn meta(number: u64, smallest: (&[u8], u64), largest: (&[u8], u64)) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            1 << 20,
            InternalKey::new(smallest.0, smallest.1, ValueType::Put),
            InternalKey::new(largest.0, largest.1, ValueType::Put),
        ))
    }

    fn new_vset(dir: &TempDir) -> VersionSet {
        let options = Options {
            comparator: Arc::new(BytewiseComparator),
            ..Options::default()
        };
        let table_cache = Arc::new(TableCache::new(
            dir.path().to_path_buf(),
            options.clone(),
            Arc::new(ShardedCache::new(1 << 20)),
            100,
        ));
        VersionSet::new(dir.path().to_path_buf(), options, table_cache)
    }

    #[test]
    fn test_file_number_allocation() {
        let dir = TempDir::new().unwrap();
        let mut vset = new_vset(&dir);
        let a = vset.new_file_number();
        let b = vset.new_file_number();
        assert_eq!(b, a + 1);

        // Only the most recent number can be returned.
        vset.reuse_file_number(b);
        assert_eq!(vset.new_file_number(), b);
        vset.reuse_file_number(a);
        assert_ne!(vset.new_file_number(), a);

        vset.mark_file_number_used(100);
        assert_eq!(vset.new_file_number(), 101);
    }

    #[test]
    fn test_log_and_apply_installs_version() {
        let dir = TempDir::new().unwrap();
        let mut vset = new_vset(&dir);
        vset.manifest_file_number = vset.new_file_number();

        let mut edit = VersionEdit::new();
        edit.set_comparator_name("emberdb.BytewiseComparator");
        let f = meta(7, (b"a", 10), (b"m", 5));
        edit.add_file(2, f.number, f.size, f.smallest.clone(), f.largest.clone());
        vset.log_and_apply(&mut edit).unwrap();

        assert_eq!(vset.num_level_files(2), 1);
        assert_eq!(vset.current().files[2][0].number, 7);
        assert!(std::fs::metadata(crate::db::filename::current_file_name(dir.path())).is_ok());
    }

    #[test]
    fn test_recover_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let mut vset = new_vset(&dir);
            vset.manifest_file_number = vset.new_file_number();
            let mut edit = VersionEdit::new();
            edit.set_comparator_name("emberdb.BytewiseComparator");
            let f = meta(9, (b"k1", 33), (b"k9", 21));
            edit.add_file(1, f.number, f.size, f.smallest.clone(), f.largest.clone());
            edit.set_log_number(12);
            vset.mark_file_number_used(12);
            vset.set_last_sequence(777);
            vset.log_and_apply(&mut edit).unwrap();
        }

        let mut vset = new_vset(&dir);
        let save_manifest = vset.recover().unwrap();
        assert!(save_manifest);
        assert_eq!(vset.num_level_files(1), 1);
        assert_eq!(vset.last_sequence(), 777);
        assert_eq!(vset.log_number(), 12);
        assert!(vset.next_file_number > 12);
    }

    #[test]
    fn test_recover_rejects_comparator_mismatch() {
        struct WeirdComparator;
        impl crate::comparator::Comparator for WeirdComparator {
            fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
                a.cmp(b)
            }
            fn name(&self) -> &'static str {
                "test.WeirdComparator"
            }
            fn find_shortest_separator(&self, _start: &mut Vec<u8>, _limit: &[u8]) {}
            fn find_short_successor(&self, _key: &mut Vec<u8>) {}
        }

        let dir = TempDir::new().unwrap();
        {
            let mut vset = new_vset(&dir);
            vset.manifest_file_number = vset.new_file_number();
            let mut edit = VersionEdit::new();
            edit.set_comparator_name("emberdb.BytewiseComparator");
            vset.log_and_apply(&mut edit).unwrap();
        }

        let options = Options {
            comparator: Arc::new(WeirdComparator),
            ..Options::default()
        };
        let table_cache = Arc::new(TableCache::new(
            dir.path().to_path_buf(),
            options.clone(),
            Arc::new(ShardedCache::new(1 << 20)),
            100,
        ));
        let mut vset = VersionSet::new(dir.path().to_path_buf(), options, table_cache);
        let err = vset.recover().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_boundary_files_travel_together() {
        let cmp = icmp();
        // File 1 ends at ("key", seq 5); file 2 starts at ("key", seq 3):
        // same user key split across files.
        let f1 = meta(1, (b"a", 10), (b"key", 5));
        let f2 = meta(2, (b"key", 3), (b"z", 1));
        let level_files = vec![Arc::clone(&f1), Arc::clone(&f2)];

        let mut compaction_files = vec![Arc::clone(&f1)];
        add_boundary_inputs(&cmp, &level_files, &mut compaction_files);
        assert_eq!(compaction_files.len(), 2);
        assert_eq!(compaction_files[1].number, 2);

        // No shared user key at the boundary: nothing added.
        let f3 = meta(3, (b"a", 10), (b"key", 5));
        let f4 = meta(4, (b"lemon", 9), (b"z", 1));
        let mut compaction_files = vec![Arc::clone(&f3)];
        add_boundary_inputs(&cmp, &[f3.clone(), f4.clone()], &mut compaction_files);
        assert_eq!(compaction_files.len(), 1);
    }

    #[test]
    fn test_pick_compaction_level0() {
        let dir = TempDir::new().unwrap();
        let mut vset = new_vset(&dir);
        vset.manifest_file_number = vset.new_file_number();

        // Four overlapping level-0 files trip the size trigger.
        let mut edit = VersionEdit::new();
        edit.set_comparator_name("emberdb.BytewiseComparator");
        for i in 0..4u64 {
            let f = meta(10 + i, (b"a", 40 - i), (b"m", 4 - (i % 4)));
            edit.add_file(0, f.number, f.size, f.smallest.clone(), f.largest.clone());
        }
        vset.log_and_apply(&mut edit).unwrap();
        assert!(vset.needs_compaction());

        let c = vset.pick_compaction().expect("compaction expected");
        assert_eq!(c.level(), 0);
        // All overlapping level-0 files are swept in.
        assert_eq!(c.num_input_files(0), 4);
    }

    #[test]
    fn test_trivial_move() {
        let dir = TempDir::new().unwrap();
        let vset = new_vset(&dir);
        let mut c = Compaction::new(&vset.options, 1);
        c.inputs[0].push(meta(1, (b"a", 5), (b"b", 4)));
        let mut v = Version::new(
            vset.icmp.clone(),
            Arc::clone(&vset.table_cache),
            vset.options.clone(),
        );
        finalize(&mut v);
        c.input_version = Some(Arc::new(v));
        assert!(c.is_trivial_move());

        c.inputs[1].push(meta(2, (b"a", 9), (b"c", 2)));
        assert!(!c.is_trivial_move());
    }
}
