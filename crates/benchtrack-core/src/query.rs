//! Read-only lookups over a [`HistoryStore`].

use std::collections::BTreeSet;

use time::OffsetDateTime;

use crate::store::{HistoryStore, ReadBounds, SeriesCursor, SeriesEntry, SeriesInfo};
use crate::{BenchError, SeriesKey};

/// Pull-based reads. Never writes and never runs the detector.
#[derive(Clone, Copy)]
pub struct QueryEngine<'a> {
    store: &'a dyn HistoryStore,
}

impl<'a> QueryEngine<'a> {
    #[must_use]
    pub fn new(store: &'a dyn HistoryStore) -> Self {
        Self { store }
    }

    /// Newest committed entry of a series.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    pub fn latest(&self, key: &SeriesKey) -> Result<Option<SeriesEntry>, BenchError> {
        Ok(self.store.read_tail(key, None, 1)?.pop())
    }

    /// Lazy walk over entries with `recorded_at` in `[from, to]`; open ends are
    /// unbounded.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the snapshot cannot be
    /// pinned.
    pub fn range(
        &self,
        key: &SeriesKey,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<SeriesCursor<'a>, BenchError> {
        SeriesCursor::open(self.store, key.clone(), ReadBounds::between(from, to))
    }

    /// The whole series in commit order.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the snapshot cannot be
    /// pinned.
    pub fn history(&self, key: &SeriesKey) -> Result<SeriesCursor<'a>, BenchError> {
        SeriesCursor::open(self.store, key.clone(), ReadBounds::all())
    }

    /// Last `count` entries, oldest first.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    pub fn last(&self, key: &SeriesKey, count: usize) -> Result<Vec<SeriesEntry>, BenchError> {
        self.store.read_tail(key, None, count)
    }

    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    pub fn list_series(&self, tool: &str) -> Result<BTreeSet<String>, BenchError> {
        self.store.list_series(tool)
    }

    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    pub fn series_info(&self, key: &SeriesKey) -> Result<Option<SeriesInfo>, BenchError> {
        self.store.series_info(key)
    }

    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    pub fn all_series(&self) -> Result<Vec<SeriesInfo>, BenchError> {
        self.store.all_series()
    }
}
