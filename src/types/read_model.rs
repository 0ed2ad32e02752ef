//! Read model types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A denormalized, independently queryable projection record
///
/// `version` is the storage version used for compare-and-set: `0` means the
/// record has never been stored, and every successful store increments it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModelRecord {
    pub type_name: String,
    pub id: String,
    #[serde(default)]
    pub version: u64,
    /// Schema version of `fields`
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

fn default_schema_version() -> u32 {
    1
}

impl ReadModelRecord {
    /// Create an empty, never-stored record
    pub fn new(type_name: impl Into<String>, id: impl Into<String>, schema_version: u32) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
            version: 0,
            schema_version,
            fields: Map::new(),
        }
    }

    /// Read a top-level field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Look up a nested field by path segments
    pub fn lookup<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        lookup_path(&self.fields, path)
    }

    /// Overwrite the given top-level fields and leave every other field untouched
    pub fn merge(&mut self, fields: Map<String, Value>) {
        for (name, value) in fields {
            self.fields.insert(name, value);
        }
    }

    /// Parse the fields as a specific type
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }
}

/// Resolve a nested path inside a field map
pub fn lookup_path<'a, S: AsRef<str>>(fields: &'a Map<String, Value>, path: &[S]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = fields.get(first.as_ref())?;
    for segment in rest {
        current = current.get(segment.as_ref())?;
    }
    Some(current)
}

/// Sort direction for read model searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Sort a search by one (possibly dotted) field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// One page of search results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<ReadModelRecord>,
    /// Opaque cursor for the next page; `None` on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_preserves_unowned_fields() {
        let mut record = ReadModelRecord::new("CarView", "c-1", 1);
        record.merge(json!({"model": "T", "owner": {"name": "Ann"}}).as_object().unwrap().clone());
        record.merge(json!({"owner": {"name": "Bea"}}).as_object().unwrap().clone());

        assert_eq!(record.get("model"), Some(&json!("T")));
        assert_eq!(record.lookup(&["owner", "name"]), Some(&json!("Bea")));
    }

    #[test]
    fn test_sort_direction_serialization() {
        let sort: SortBy = serde_json::from_value(json!({"field": "price", "direction": "DESC"})).unwrap();
        assert_eq!(sort, SortBy::desc("price"));

        let default: SortBy = serde_json::from_value(json!({"field": "price"})).unwrap();
        assert_eq!(default.direction, SortDirection::Asc);
    }
}
