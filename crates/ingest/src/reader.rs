//! Delimited-text reader for the worker binary, built on the `csv` crate.

use std::collections::HashMap;

use tally_core::{Record, TallyError};

fn schema_error(err: csv::Error) -> TallyError {
    TallyError::Schema(format!("malformed delimited input: {err}"))
}

/// Split `text` into a header row and records.
///
/// Fields may be quoted (RFC 4180) and are trimmed. Blank rows are skipped and
/// do not consume a record index, but every record keeps the physical line it
/// started on. Fields beyond the header width are dropped, and short rows
/// simply lack the trailing columns.
pub fn read_delimited(text: &str, delimiter: char) -> Result<(Vec<String>, Vec<Record>), TallyError> {
    let delimiter = u8::try_from(delimiter)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| {
            TallyError::Schema(format!("delimiter {delimiter:?} is not a single ASCII byte"))
        })?;

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.trim_start_matches('\u{feff}').as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(schema_error)?
        .iter()
        .map(str::to_string)
        .collect();
    if headers.iter().all(String::is_empty) {
        return Err(TallyError::Schema("input has no header row".to_string()));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(schema_error)?;
        if row.iter().all(str::is_empty) {
            continue;
        }
        let fields: HashMap<String, String> = headers
            .iter()
            .zip(row.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();
        let record = Record::new(records.len(), fields);
        let record = match row.position() {
            Some(pos) => record.at_line(pos.line() as usize),
            None => record,
        };
        records.push(record);
    }

    Ok((headers, records))
}
