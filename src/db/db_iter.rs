//! The user-facing iterator.
//!
//! Wraps the internal merging iterator (memtables + all table files) and
//! collapses it into the logical map as of one sequence number: entries
//! newer than the snapshot are invisible, only the newest surviving
//! version of each user key is emitted, and tombstoned keys are skipped.
//! Backward movement mirrors the forward logic with a saved-entry buffer,
//! since the merged stream arrives in internal-key order.

use std::cmp::Ordering;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::comparator::Comparator;
use crate::error::Result;
use crate::iterator::Iter;
use crate::key::{
    append_internal_key, extract_user_key, parse_internal_key, SequenceNumber, ValueType,
    VALUE_TYPE_FOR_SEEK,
};
use crate::version::Version;

#[derive(PartialEq, Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

pub struct DbIterator {
    db: Arc<crate::db::DbInner>,
    ucmp: Arc<dyn Comparator>,
    inner: Box<dyn Iter>,
    sequence: SequenceNumber,

    direction: Direction,
    valid: bool,
    /// Current user key when moving backward; scratch otherwise.
    saved_key: Vec<u8>,
    /// Current value when moving backward.
    saved_value: Vec<u8>,
    status: Result<()>,

    /// Pins the version (and through it the table files) this iterator
    /// reads; the child iterators pin the memtables.
    _version: Arc<Version>,

    rng: SmallRng,
    bytes_until_read_sampling: usize,
}

impl DbIterator {
    pub(crate) fn new(
        db: Arc<crate::db::DbInner>,
        inner: Box<dyn Iter>,
        sequence: SequenceNumber,
        version: Arc<Version>,
        rng_seed: u64,
    ) -> Self {
        let ucmp = db.ucmp();
        let mut rng = SmallRng::seed_from_u64(rng_seed);
        let first_sample = Self::draw_sample_period(&mut rng, db.read_sample_period());
        Self {
            db,
            ucmp,
            inner,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            status: Ok(()),
            _version: version,
            rng,
            bytes_until_read_sampling: first_sample,
        }
    }

    fn draw_sample_period(rng: &mut SmallRng, period: usize) -> usize {
        // Uniform in [0, 2*period) keeps the expected sampling rate at one
        // per `period` bytes without a fixed stride.
        rng.gen_range(0..(2 * period).max(1))
    }

    /// Records bytes visited and occasionally samples the key for
    /// seek-compaction accounting.
    fn note_bytes_read(&mut self) {
        let bytes = self.inner.key().len() + self.inner.value().len();
        while self.bytes_until_read_sampling < bytes {
            let period = self.db.read_sample_period();
            self.bytes_until_read_sampling += Self::draw_sample_period(&mut self.rng, period);
            self.db.record_read_sample(self.inner.key());
        }
        self.bytes_until_read_sampling -= bytes;
    }

    /// Decodes the inner entry, latching corruption into `status`.
    fn parse_entry(&mut self) -> Option<(Vec<u8>, SequenceNumber, ValueType)> {
        self.note_bytes_read();
        match parse_internal_key(self.inner.key()) {
            Ok(parsed) => Some((parsed.user_key, parsed.sequence, parsed.value_type)),
            Err(e) => {
                if self.status.is_ok() {
                    self.status = Err(e);
                }
                None
            }
        }
    }

    /// Positions on the next visible user entry at or after the inner
    /// cursor. When `skipping`, entries for user keys <= `saved_key` are
    /// hidden (they are older versions of a key already emitted).
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);
        while self.inner.valid() {
            if let Some((user_key, seq, value_type)) = self.parse_entry() {
                if seq <= self.sequence {
                    match value_type {
                        ValueType::Deletion => {
                            // Hide every older entry for this key.
                            self.saved_key = user_key;
                            skipping = true;
                        }
                        ValueType::Put => {
                            if skipping
                                && self.ucmp.compare(&user_key, &self.saved_key)
                                    != Ordering::Greater
                            {
                                // An older version of a handled key.
                            } else {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }
            self.inner.next();
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Positions on the previous visible user entry, buffering it in
    /// `saved_key`/`saved_value`: the merged stream yields newest-first,
    /// so walking backward sees older versions first and must keep the
    /// last acceptable one.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        while self.inner.valid() {
            if let Some((user_key, seq, entry_type)) = self.parse_entry() {
                if seq <= self.sequence {
                    if value_type != ValueType::Deletion
                        && self.ucmp.compare(&user_key, &self.saved_key) == Ordering::Less
                    {
                        // The saved entry is the newest visible version of
                        // its key; stop before the previous key.
                        break;
                    }
                    value_type = entry_type;
                    if value_type == ValueType::Deletion {
                        self.saved_key.clear();
                        self.saved_value.clear();
                    } else {
                        self.saved_key = user_key;
                        self.saved_value = self.inner.value().to_vec();
                    }
                }
            }
            self.inner.prev();
        }

        if value_type == ValueType::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

impl Iter for DbIterator {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value.clear();
        let mut seek_key = Vec::with_capacity(target.len() + 8);
        append_internal_key(&mut seek_key, target, self.sequence, VALUE_TYPE_FOR_SEEK);
        self.inner.seek(&seek_key);
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The inner cursor sits just before the saved entry (or is
            // exhausted); hop back onto the first entry at or after it.
            if !self.inner.valid() {
                self.inner.seek_to_first();
            } else {
                self.inner.next();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key already holds the current user key to skip past.
        } else {
            self.saved_key.clear();
            self.saved_key.extend_from_slice(extract_user_key(self.inner.key()));
            self.inner.next();
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }
        self.find_next_user_entry(true);
    }

    fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // Walk the inner cursor to just before the current user key.
            debug_assert!(self.inner.valid());
            self.saved_key.clear();
            self.saved_key.extend_from_slice(extract_user_key(self.inner.key()));
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                if self
                    .ucmp
                    .compare(extract_user_key(self.inner.key()), &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.inner.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    fn status(&self) -> Result<()> {
        self.status.clone()?;
        self.inner.status()
    }
}
