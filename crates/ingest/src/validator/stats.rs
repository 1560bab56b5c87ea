use serde::{Deserialize, Serialize};

/// Per-column statistics gathered while validating a batch. Reporting only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub non_null_count: u64,
    pub null_count: u64,
    /// Numeric columns only: values that parsed as non-negative integers.
    pub numeric_count: u64,
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub avg: Option<f64>,
    #[serde(skip)]
    sum: u128,
}

impl ColumnStats {
    pub fn observe_null(&mut self) {
        self.null_count += 1;
    }

    pub fn observe_text(&mut self) {
        self.non_null_count += 1;
    }

    pub fn observe_number(&mut self, value: u64) {
        self.non_null_count += 1;
        self.numeric_count += 1;
        self.sum += u128::from(value);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        self.avg = Some(self.sum as f64 / self.numeric_count as f64);
    }
}
