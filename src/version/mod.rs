//! Versions: immutable snapshots of the on-disk file set.
//!
//! A version maps each level to an ordered list of table files. Level 0
//! files may overlap each other (they are memtable flushes); every deeper
//! level is sorted by smallest key with pairwise-disjoint ranges. Reads,
//! iterators, and compactions each pin the version they started from, so
//! installing a successor never disturbs work in flight.

pub mod edit;
pub mod set;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrd};
use std::sync::{Arc, Mutex};

use crate::comparator::InternalKeyComparator;
use crate::config::{
    max_bytes_for_level, Options, ReadOptions, L0_COMPACTION_TRIGGER, MAX_MEM_COMPACT_LEVEL,
    NUM_LEVELS,
};
use crate::encoding::{decode_fixed64, put_fixed64};
use crate::error::Result;
use crate::iterator::Iter;
use crate::key::{parse_internal_key, InternalKey, LookupKey, ValueType};
use crate::table_cache::TableCache;

/// Descriptor of one table file on disk.
#[derive(Debug)]
pub struct FileMetaData {
    pub number: u64,
    pub size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Seeks that may pass through this file before it becomes a
    /// seek-compaction candidate.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        // One seek costs roughly as much as compacting 16 KiB of data, so
        // a file earns one seek per 16 KiB, floored at 100.
        let allowed = (size / 16384).max(100) as i64;
        Self {
            number,
            size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed),
        }
    }
}

/// Stats returned by a point lookup so the caller can charge the seek.
#[derive(Clone)]
pub struct GetStats {
    pub seek_file: Arc<FileMetaData>,
    pub seek_file_level: usize,
}

/// First index in `files` whose largest key is >= `ikey` (files sorted by
/// smallest, disjoint).
pub(crate) fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    ikey: &[u8],
) -> usize {
    let mut left = 0;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(files[mid].largest.encoded(), ikey) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

fn after_file(ucmp: &Arc<dyn crate::comparator::Comparator>, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    // True when user_key is past everything in f.
    match user_key {
        Some(k) => ucmp.compare(k, f.largest.user_key()) == Ordering::Greater,
        None => false,
    }
}

fn before_file(ucmp: &Arc<dyn crate::comparator::Comparator>, user_key: Option<&[u8]>, f: &FileMetaData) -> bool {
    match user_key {
        Some(k) => ucmp.compare(k, f.smallest.user_key()) == Ordering::Less,
        None => false,
    }
}

/// Whether any file in `files` overlaps `[smallest, largest]` (None means
/// unbounded). `disjoint` enables the binary-search fast path.
pub(crate) fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint: bool,
    files: &[Arc<FileMetaData>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator();
    if !disjoint {
        return files.iter().any(|f| {
            !(after_file(ucmp, smallest_user_key, f) || before_file(ucmp, largest_user_key, f))
        });
    }

    let index = match smallest_user_key {
        Some(k) => {
            let small = LookupKey::new(k, crate::key::MAX_SEQUENCE_NUMBER);
            find_file(icmp, files, small.internal_key())
        }
        None => 0,
    };
    if index >= files.len() {
        return false;
    }
    !before_file(ucmp, largest_user_key, &files[index])
}

pub struct Version {
    pub(crate) icmp: InternalKeyComparator,
    pub(crate) table_cache: Arc<TableCache>,
    pub(crate) options: Options,
    pub(crate) files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],

    /// Precomputed by `VersionSet::finalize`: the level most in need of a
    /// size compaction and its score (>= 1 means compact).
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,

    /// Next seek-triggered compaction candidate, set by `update_stats`.
    pub(crate) file_to_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,
}

impl Version {
    pub(crate) fn new(
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
        options: Options,
    ) -> Self {
        Self {
            icmp,
            table_cache,
            options,
            files: Default::default(),
            compaction_score: -1.0,
            compaction_level: 0,
            file_to_compact: Mutex::new(None),
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.size).sum()
    }

    /// Candidate files for `user_key`, newest first, until `visit` returns
    /// false.
    fn for_each_overlapping<F>(&self, user_key: &[u8], internal_key: &[u8], mut visit: F)
    where
        F: FnMut(usize, &Arc<FileMetaData>) -> bool,
    {
        let ucmp = self.icmp.user_comparator().clone();

        // Level 0: all overlapping files, newest (highest number) first.
        let mut l0: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater
            })
            .collect();
        l0.sort_by(|a, b| b.number.cmp(&a.number));
        for f in l0 {
            if !visit(0, f) {
                return;
            }
        }

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(&self.icmp, files, internal_key);
            if index < files.len() {
                let f = &files[index];
                if ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && !visit(level, f)
                {
                    return;
                }
            }
        }
    }

    /// Point lookup through the on-disk levels. Returns the value (or
    /// `None` for absent/deleted) plus seek stats when more than one file
    /// had to be consulted.
    pub fn get(
        &self,
        options: &ReadOptions,
        key: &LookupKey,
        stats: &mut Option<GetStats>,
    ) -> Result<Option<Vec<u8>>> {
        let ucmp = self.icmp.user_comparator().clone();
        let user_key = key.user_key();
        let ikey = key.internal_key();

        enum Outcome {
            Found(Vec<u8>),
            Deleted,
            Corrupt(crate::error::Error),
        }

        let mut outcome: Option<Outcome> = None;
        let mut last_file_read: Option<(Arc<FileMetaData>, usize)> = None;

        self.for_each_overlapping(user_key, ikey, |level, f| {
            // Charge the first file searched once a second one is needed.
            if stats.is_none() {
                if let Some((file, level)) = &last_file_read {
                    *stats = Some(GetStats {
                        seek_file: Arc::clone(file),
                        seek_file_level: *level,
                    });
                }
            }
            last_file_read = Some((Arc::clone(f), level));

            match self.table_cache.get(options, f.number, f.size, ikey) {
                Ok(None) => true, // nothing at or after ikey in this file
                Ok(Some((entry_key, entry_value))) => match parse_internal_key(&entry_key) {
                    Ok(parsed) => {
                        if ucmp.compare(&parsed.user_key, user_key) != Ordering::Equal {
                            return true; // different user key: keep looking
                        }
                        match parsed.value_type {
                            ValueType::Put => {
                                outcome = Some(Outcome::Found(entry_value));
                            }
                            ValueType::Deletion => {
                                outcome = Some(Outcome::Deleted);
                            }
                        }
                        false
                    }
                    Err(e) => {
                        outcome = Some(Outcome::Corrupt(e));
                        false
                    }
                },
                Err(e) => {
                    outcome = Some(Outcome::Corrupt(e));
                    false
                }
            }
        });

        match outcome {
            Some(Outcome::Found(v)) => Ok(Some(v)),
            Some(Outcome::Deleted) | None => Ok(None),
            Some(Outcome::Corrupt(e)) => Err(e),
        }
    }

    /// Charges a seek against the file `get` touched first. Returns true
    /// when a seek compaction became pending.
    pub fn update_stats(&self, stats: &GetStats) -> bool {
        let remaining = stats
            .seek_file
            .allowed_seeks
            .fetch_sub(1, AtomicOrd::Relaxed)
            - 1;
        if remaining <= 0 {
            let mut pending = self.file_to_compact.lock().unwrap();
            if pending.is_none() {
                *pending = Some((Arc::clone(&stats.seek_file), stats.seek_file_level));
                return true;
            }
        }
        false
    }

    /// Samples a key read by iteration. When two or more files overlap the
    /// key, the first is charged as if a `get` had passed through it.
    pub fn record_read_sample(&self, internal_key: &[u8]) -> bool {
        let Ok(parsed) = parse_internal_key(internal_key) else {
            return false;
        };

        let mut first: Option<GetStats> = None;
        let mut matches = 0;
        self.for_each_overlapping(&parsed.user_key, internal_key, |level, f| {
            matches += 1;
            if matches == 1 {
                first = Some(GetStats {
                    seek_file: Arc::clone(f),
                    seek_file_level: level,
                });
            }
            matches < 2
        });

        if matches >= 2 {
            if let Some(stats) = first {
                return self.update_stats(&stats);
            }
        }
        false
    }

    pub(crate) fn file_to_compact(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.file_to_compact.lock().unwrap().clone()
    }

    /// Whether any file at `level` overlaps the user-key range.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// Level a fresh memtable flush may be placed at: 0 if it overlaps
    /// level 0, otherwise the deepest level <= MAX_MEM_COMPACT_LEVEL whose
    /// next level does not overlap and whose grandparents would not
    /// overlap too much.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        if self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            return 0;
        }
        let start = InternalKey::new(
            smallest_user_key,
            crate::key::MAX_SEQUENCE_NUMBER,
            crate::key::VALUE_TYPE_FOR_SEEK,
        );
        let limit = InternalKey::new(largest_user_key, 0, ValueType::Deletion);

        let mut level = 0;
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let mut overlaps = Vec::new();
                self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit), &mut overlaps);
                let total: u64 = overlaps.iter().map(|f| f.size).sum();
                if total > crate::config::max_grand_parent_overlap_bytes(&self.options) {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// All files at `level` whose user-key range intersects
    /// `[begin, end]`; `None` bounds are unbounded. For level 0, a hit
    /// whose range extends the query restarts the search with the wider
    /// bounds until it stabilizes.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
        inputs: &mut Vec<Arc<FileMetaData>>,
    ) {
        inputs.clear();
        let ucmp = self.icmp.user_comparator().clone();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let mut i = 0;
        while i < self.files[level].len() {
            let f = Arc::clone(&self.files[level][i]);
            i += 1;
            let file_start = f.smallest.user_key();
            let file_limit = f.largest.user_key();

            if let Some(b) = &user_begin {
                if ucmp.compare(file_limit, b) == Ordering::Less {
                    continue;
                }
            }
            if let Some(e) = &user_end {
                if ucmp.compare(file_start, e) == Ordering::Greater {
                    continue;
                }
            }

            if level == 0 {
                // Level-0 files overlap each other; a widened range can
                // pull in files already skipped, so restart.
                let mut restart = false;
                if let Some(b) = &user_begin {
                    if ucmp.compare(file_start, b) == Ordering::Less {
                        user_begin = Some(file_start.to_vec());
                        restart = true;
                    }
                }
                if let Some(e) = &user_end {
                    if ucmp.compare(file_limit, e) == Ordering::Greater {
                        user_end = Some(file_limit.to_vec());
                        restart = true;
                    }
                }
                if restart {
                    inputs.clear();
                    i = 0;
                    continue;
                }
            }
            inputs.push(f);
        }
    }

    /// Iterators covering every on-disk entry in this version: one per
    /// level-0 file, one concatenating iterator per deeper level.
    pub fn add_iterators(self: &Arc<Self>, options: &ReadOptions, iters: &mut Vec<Box<dyn Iter>>) {
        for f in &self.files[0] {
            iters.push(self.table_cache.iter(options, f.number, f.size));
        }
        for level in 1..NUM_LEVELS {
            if !self.files[level].is_empty() {
                iters.push(self.level_iter(options, level));
            }
        }
    }

    /// Concatenating iterator over one disjoint level: a file-list index
    /// whose entries open table iterators on demand.
    pub(crate) fn level_iter(
        self: &Arc<Self>,
        options: &ReadOptions,
        level: usize,
    ) -> Box<dyn Iter> {
        let index = LevelFileNumIterator::new(self.icmp.clone(), self.files[level].clone());
        let table_cache = Arc::clone(&self.table_cache);
        let options = options.clone();
        crate::table::TwoLevelIterator::new(
            Box::new(index),
            Box::new(move |file_value| {
                if file_value.len() != 16 {
                    return Box::new(crate::iterator::EmptyIterator::with_error(
                        crate::corruption!("bad file entry in level iterator"),
                    ));
                }
                let number = decode_fixed64(&file_value[0..8]);
                let size = decode_fixed64(&file_value[8..16]);
                table_cache.iter(&options, number, size)
            }),
        )
    }

    /// Human-readable per-level file counts, for logs and properties.
    pub fn level_summary(&self) -> String {
        let counts: Vec<String> = self.files.iter().map(|f| f.len().to_string()).collect();
        format!("files[ {} ]", counts.join(" "))
    }
}

/// Computes the size-compaction score for `v` and records the neediest
/// level. Level 0 scores by file count, deeper levels by byte volume.
pub(crate) fn finalize(v: &mut Version) {
    let mut best_level = 0;
    let mut best_score = -1.0f64;
    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            v.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            v.level_bytes(level) as f64 / max_bytes_for_level(level)
        };
        if score > best_score {
            best_level = level;
            best_score = score;
        }
    }
    v.compaction_level = best_level;
    v.compaction_score = best_score;
}

/// Index iterator over one level's file list: key = file's largest
/// internal key, value = fixed64 number ‖ fixed64 size.
pub(crate) struct LevelFileNumIterator {
    icmp: InternalKeyComparator,
    files: Vec<Arc<FileMetaData>>,
    index: usize,
    value_buf: Vec<u8>,
}

impl LevelFileNumIterator {
    pub fn new(icmp: InternalKeyComparator, files: Vec<Arc<FileMetaData>>) -> Self {
        let index = files.len();
        Self {
            icmp,
            files,
            index,
            value_buf: Vec::with_capacity(16),
        }
    }

    fn fill_value(&mut self) {
        if self.index < self.files.len() {
            let f = &self.files[self.index];
            self.value_buf.clear();
            put_fixed64(&mut self.value_buf, f.number);
            put_fixed64(&mut self.value_buf, f.size);
        }
    }
}

impl Iter for LevelFileNumIterator {
    fn valid(&self) -> bool {
        self.index < self.files.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
        self.fill_value();
    }

    fn seek_to_last(&mut self) {
        self.index = self.files.len().saturating_sub(1);
        if self.files.is_empty() {
            self.index = 0;
        }
        self.fill_value();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = find_file(&self.icmp, &self.files, target);
        self.fill_value();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.index += 1;
        self.fill_value();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if self.index == 0 {
            self.index = self.files.len();
        } else {
            self.index -= 1;
            self.fill_value();
        }
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.files[self.index].largest.encoded()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.value_buf
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
