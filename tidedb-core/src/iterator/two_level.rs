//! Two-level iteration: an index cursor whose values open second-level cursors
//!
//! Used for tables (index block → data blocks) and for sorted levels
//! (file list → table iterators).

use super::InternalIterator;
use crate::{Result, TideError};

/// Opens the second-level iterator named by an index entry's value
pub trait BlockSource: Send {
    fn open_block(&self, handle: &[u8]) -> Result<Box<dyn InternalIterator>>;
}

pub struct TwoLevelIterator<S: BlockSource> {
    index: Box<dyn InternalIterator>,
    source: S,
    data: Option<Box<dyn InternalIterator>>,
    data_handle: Vec<u8>,
    error: Option<TideError>,
}

impl<S: BlockSource> TwoLevelIterator<S> {
    pub fn new(index: Box<dyn InternalIterator>, source: S) -> Self {
        Self {
            index,
            source,
            data: None,
            data_handle: Vec::new(),
            error: None,
        }
    }

    fn save_error(&mut self, err: TideError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn set_data(&mut self, data: Option<Box<dyn InternalIterator>>) {
        let old_status = self.data.as_ref().map(|d| d.status());
        if let Some(Err(e)) = old_status {
            self.save_error(e);
        }
        self.data = data;
    }

    fn init_data_block(&mut self) {
        if !self.index.valid() {
            self.set_data(None);
            return;
        }
        let handle = self.index.value();
        if self.data.is_some() && handle == self.data_handle.as_slice() {
            return;
        }
        let handle = handle.to_vec();
        match self.source.open_block(&handle) {
            Ok(iter) => {
                self.set_data(Some(iter));
                self.data_handle = handle;
            }
            Err(e) => {
                self.save_error(e);
                self.set_data(None);
                self.data_handle.clear();
            }
        }
    }

    fn data_valid(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.valid())
    }

    // A failed block read ends iteration; the error is reported by status()
    fn skip_empty_forward(&mut self) {
        while !self.data_valid() {
            if self.error.is_some() || !self.index.valid() {
                self.set_data(None);
                return;
            }
            let data_status = self.data.as_ref().map(|d| d.status());
            if let Some(Err(e)) = data_status {
                self.save_error(e);
                continue;
            }
            self.index.next();
            self.init_data_block();
            if let Some(data) = &mut self.data {
                data.seek_to_first();
            }
        }
    }

    fn skip_empty_backward(&mut self) {
        while !self.data_valid() {
            if self.error.is_some() || !self.index.valid() {
                self.set_data(None);
                return;
            }
            let data_status = self.data.as_ref().map(|d| d.status());
            if let Some(Err(e)) = data_status {
                self.save_error(e);
                continue;
            }
            self.index.prev();
            self.init_data_block();
            if let Some(data) = &mut self.data {
                data.seek_to_last();
            }
        }
    }
}

impl<S: BlockSource> InternalIterator for TwoLevelIterator<S> {
    fn valid(&self) -> bool {
        self.error.is_none() && self.data_valid()
    }

    fn seek_to_first(&mut self) {
        self.index.seek_to_first();
        self.init_data_block();
        if let Some(data) = &mut self.data {
            data.seek_to_first();
        }
        self.skip_empty_forward();
    }

    fn seek_to_last(&mut self) {
        self.index.seek_to_last();
        self.init_data_block();
        if let Some(data) = &mut self.data {
            data.seek_to_last();
        }
        self.skip_empty_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index.seek(target);
        self.init_data_block();
        if let Some(data) = &mut self.data {
            data.seek(target);
        }
        self.skip_empty_forward();
    }

    fn next(&mut self) {
        if let Some(data) = &mut self.data {
            data.next();
        }
        self.skip_empty_forward();
    }

    fn prev(&mut self) {
        if let Some(data) = &mut self.data {
            data.prev();
        }
        self.skip_empty_backward();
    }

    fn key(&self) -> &[u8] {
        self.data.as_ref().map(|d| d.key()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.data.as_ref().map(|d| d.value()).unwrap_or(&[])
    }

    fn status(&self) -> Result<()> {
        if let Some(e) = &self.error {
            return Err(e.duplicate());
        }
        self.index.status()?;
        match &self.data {
            Some(data) => data.status(),
            None => Ok(()),
        }
    }
}
