use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One parsed row of the input file. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Zero-based position of the row among the data rows (header excluded).
    pub index: usize,
    /// 1-based line in the source file where the row starts (header is line 1).
    pub line: usize,
    /// Raw column values keyed by header name.
    pub fields: HashMap<String, String>,
}

impl Record {
    /// Build a record assumed to sit on line `index + 2` (no blank lines above).
    pub fn new(index: usize, fields: HashMap<String, String>) -> Self {
        Self {
            index,
            line: index + 2,
            fields,
        }
    }

    /// Override the source line, for readers that track physical positions.
    pub fn at_line(mut self, line: usize) -> Self {
        self.line = line;
        self
    }

    /// Build a record from `(column, value)` pairs.
    pub fn from_pairs<K, V>(index: usize, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            index,
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    pub fn line(&self) -> usize {
        self.line
    }
}

/// A bounded slice of records processed together as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub batch_index: usize,
    pub execution_id: String,
    pub items: Vec<Record>,
}

impl Chunk {
    pub fn new(
        chunk_id: impl Into<String>,
        batch_index: usize,
        execution_id: impl Into<String>,
        items: Vec<Record>,
    ) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            batch_index,
            execution_id: execution_id.into(),
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
