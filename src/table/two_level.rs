//! Two-level iteration: an index iterator whose values name lower-level
//! iterators (index entry -> data block, or file list -> table).

use crate::error::Result;
use crate::iterator::Iter;

type BlockFn = Box<dyn FnMut(&[u8]) -> Box<dyn Iter> + Send>;

pub struct TwoLevelIterator {
    index_iter: Box<dyn Iter>,
    block_fn: BlockFn,
    data_iter: Option<Box<dyn Iter>>,
    /// Index value the current data iterator was opened from.
    data_handle: Vec<u8>,
    status: Result<()>,
}

impl TwoLevelIterator {
    pub fn new(index_iter: Box<dyn Iter>, block_fn: BlockFn) -> Box<dyn Iter> {
        Box::new(Self {
            index_iter,
            block_fn,
            data_iter: None,
            data_handle: Vec::new(),
            status: Ok(()),
        })
    }

    fn save_error(&mut self, result: Result<()>) {
        if self.status.is_ok() {
            if let Err(e) = result {
                self.status = Err(e);
            }
        }
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }
        let handle = self.index_iter.value().to_vec();
        if self.data_iter.is_some() && handle == self.data_handle {
            // Already positioned over this block.
            return;
        }
        let iter = (self.block_fn)(&handle);
        self.data_handle = handle;
        self.data_iter = Some(iter);
    }

    fn skip_empty_blocks_forward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |it| !it.valid()) {
            if let Some(it) = &self.data_iter {
                self.save_error(it.status());
            }
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(it) = &mut self.data_iter {
                it.seek_to_first();
            }
        }
    }

    fn skip_empty_blocks_backward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |it| !it.valid()) {
            if let Some(it) = &self.data_iter {
                self.save_error(it.status());
            }
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(it) = &mut self.data_iter {
                it.seek_to_last();
            }
        }
    }
}

impl Iter for TwoLevelIterator {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|it| it.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(it) = &mut self.data_iter {
            it.seek_to_first();
        }
        self.skip_empty_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(it) = &mut self.data_iter {
            it.seek_to_last();
        }
        self.skip_empty_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(it) = &mut self.data_iter {
            it.seek(target);
        }
        self.skip_empty_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().next();
        self.skip_empty_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().prev();
        self.skip_empty_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(it) = &self.data_iter {
            it.status()?;
        }
        self.status.clone()
    }
}
