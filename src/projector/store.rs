//! Read-model store contract and shared search helpers

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::{compare_values, FilterExpression, MatcherCompiler, Predicate, PredicateCompiler};
use crate::migration::MigrationRegistry;
use crate::types::{Page, ReadModelRecord, SortBy, SortDirection};

/// Threshold for filtering candidates in parallel (record count)
const PARALLEL_FILTER_THRESHOLD: usize = 1000;

/// Keyed collection of read-model records, one per read-model type
///
/// Writes are compare-and-set on [`ReadModelRecord::version`]; there is no
/// blind overwrite.
pub trait ReadModelStore: Send + Sync {
    /// Current record, if stored
    fn fetch(&self, read_model_type: &str, id: &str) -> Result<Option<ReadModelRecord>>;

    /// Store a record if the stored version still equals `record.version`
    ///
    /// `record.version == 0` means the record must not exist yet. Returns
    /// the new version, or [`Error::Concurrency`] when another writer got
    /// there first.
    fn store(&self, record: &ReadModelRecord) -> Result<u64>;

    /// Delete a record if its stored version equals `expected_version`
    ///
    /// Deleting an absent record with `expected_version == 0` is a no-op.
    fn delete(&self, read_model_type: &str, id: &str, expected_version: u64) -> Result<()>;

    /// Every stored record of one type, as written
    fn scan(&self, read_model_type: &str) -> Result<Vec<ReadModelRecord>>;

    /// Filter, sort and page the records of one type
    ///
    /// Records are upgraded to the latest schema of their type before the
    /// filter and sort see them, so both address current field names.
    fn search(
        &self,
        read_model_type: &str,
        request: &SearchRequest,
        migrations: &MigrationRegistry,
    ) -> Result<Page> {
        let predicate = request.predicate()?;
        let candidates = self
            .scan(read_model_type)?
            .into_iter()
            .map(|record| migrations.migrate(record))
            .collect::<Result<Vec<_>>>()?;
        paginate(filter_records(candidates, &predicate), request)
    }

    /// Ids of one type in ascending order, strictly after `after`
    fn list_ids(&self, read_model_type: &str, after: Option<&str>, limit: usize)
        -> Result<Vec<String>>;
}

/// Parameters of a read-model search
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(default)]
    pub filter: Option<FilterExpression>,
    #[serde(default)]
    pub sort: Option<SortBy>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl SearchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: FilterExpression) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sort(mut self, sort: SortBy) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Compile the filter for in-memory evaluation
    pub fn predicate(&self) -> Result<Predicate> {
        match &self.filter {
            Some(filter) => MatcherCompiler::new().compile(filter),
            None => Ok(Predicate::always()),
        }
    }
}

/// Keep the records accepted by `predicate`
pub fn filter_records(records: Vec<ReadModelRecord>, predicate: &Predicate) -> Vec<ReadModelRecord> {
    if records.len() > PARALLEL_FILTER_THRESHOLD {
        records
            .into_par_iter()
            .filter(|record| predicate.matches_record(record))
            .collect()
    } else {
        records
            .into_iter()
            .filter(|record| predicate.matches_record(record))
            .collect()
    }
}

/// Sort matched records and cut out the page the request asks for
///
/// Records are ordered by the sort field (records missing it last), then by
/// id. The cursor is the offset of the next page.
pub fn paginate(mut records: Vec<ReadModelRecord>, request: &SearchRequest) -> Result<Page> {
    let offset = match &request.cursor {
        Some(cursor) => cursor
            .parse::<usize>()
            .map_err(|_| Error::InvalidFilter(format!("invalid cursor '{}'", cursor)))?,
        None => 0,
    };

    match &request.sort {
        Some(sort) => {
            let path: Vec<&str> = sort.field.split('.').collect();
            records.sort_by(|a, b| {
                let ordering = match (a.lookup(&path), b.lookup(&path)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => return Ordering::Less,
                    (None, Some(_)) => return Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                let ordering = match sort.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                };
                ordering.then_with(|| a.id.cmp(&b.id))
            });
        }
        None => records.sort_by(|a, b| a.id.cmp(&b.id)),
    }

    let total = records.len();
    let items: Vec<ReadModelRecord> = match request.limit {
        Some(limit) => records.into_iter().skip(offset).take(limit).collect(),
        None => records.into_iter().skip(offset).collect(),
    };
    let end = offset + items.len();
    let cursor = (end < total).then(|| end.to_string());

    Ok(Page { items, cursor })
}

/// Version conflict error for a read-model record
pub(crate) fn conflict(read_model_type: &str, id: &str, expected: u64, actual: u64) -> Error {
    Error::Concurrency {
        key: format!("{}/{}", read_model_type, id),
        expected,
        actual,
    }
}
