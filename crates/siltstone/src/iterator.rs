//! Engine-level iteration: ordered key scans with on-demand value reads.

use bytes::Bytes;

use crate::engine::Engine;
use crate::error::Result;
use crate::index::IndexIterator;
use crate::options::IteratorOptions;

/// Read-side facade pairing an index iterator with value retrieval.
///
/// The cursor walks a point-in-time snapshot of the index; values are read
/// from disk only when asked for. Usage follows the
/// `rewind(); while !is_end() { ...; next() }` shape, and after every
/// `rewind`, `seek`, or `next` the cursor has already skipped past keys
/// outside the configured prefix.
pub struct EngineIterator<'a> {
    engine: &'a Engine,
    index_iter: Box<dyn IndexIterator>,
    options: IteratorOptions,
}

impl Engine {
    /// Creates an iterator over the engine with the given options.
    pub fn iter(&self, options: IteratorOptions) -> Result<EngineIterator<'_>> {
        let index_iter = self.index.iterator(options.reverse)?;
        let mut iter = EngineIterator {
            engine: self,
            index_iter,
            options,
        };
        iter.rewind();
        Ok(iter)
    }
}

impl EngineIterator<'_> {
    /// Repositions the cursor at the first matching entry.
    pub fn rewind(&mut self) {
        self.index_iter.rewind();
        self.skip_to_prefix();
    }

    /// Positions the cursor at the least matching key `>=` `key` (greatest
    /// `<=` when reversed).
    pub fn seek(&mut self, key: &[u8]) {
        self.index_iter.seek(key);
        self.skip_to_prefix();
    }

    /// Advances to the next matching entry.
    pub fn next(&mut self) {
        self.index_iter.next();
        self.skip_to_prefix();
    }

    /// Whether the cursor is past the last matching entry.
    pub fn is_end(&self) -> bool {
        self.index_iter.is_end()
    }

    /// Key under the cursor.
    ///
    /// # Panics
    ///
    /// Panics if the iterator is at end; check [`EngineIterator::is_end`]
    /// first.
    pub fn key(&self) -> &[u8] {
        self.index_iter.key()
    }

    /// Reads the value under the cursor from its segment.
    pub fn value(&self) -> Result<Bytes> {
        let pos = self.index_iter.value();
        self.engine.get_value_by_position(&pos)
    }

    /// Releases the underlying index snapshot.
    pub fn close(&mut self) {
        self.index_iter.close();
    }

    fn skip_to_prefix(&mut self) {
        if self.options.prefix.is_empty() {
            return;
        }
        while !self.index_iter.is_end() && !self.index_iter.key().starts_with(&self.options.prefix)
        {
            self.index_iter.next();
        }
    }
}
