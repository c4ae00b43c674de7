use std::collections::BTreeSet;

use super::{parse_int, strip_cr, RecordSchema};
use crate::error::ParseError;

/// The columns of a line that survived the drop list, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedRecord {
    pub fields: Vec<String>,
    pub key: i64,
}

/// Column-pruning schema: keeps every column not named in `drop`.
///
/// The key column is addressed by its index in the *input* line, so it may be
/// dropped from the output and still drive the aggregation.
#[derive(Debug, Clone)]
pub struct PrunedSchema {
    delimiter: char,
    min_fields: usize,
    drop: BTreeSet<usize>,
    key_column: usize,
}

impl PrunedSchema {
    pub fn new(
        delimiter: char,
        min_fields: usize,
        drop: impl IntoIterator<Item = usize>,
        key_column: usize,
    ) -> Self {
        Self {
            delimiter,
            // a line has to at least reach the key column
            min_fields: min_fields.max(key_column + 1),
            drop: drop.into_iter().collect(),
            key_column,
        }
    }
}

impl RecordSchema for PrunedSchema {
    type Record = PrunedRecord;

    fn parse(&self, line: &str) -> Result<PrunedRecord, ParseError> {
        let fields: Vec<&str> = strip_cr(line).split(self.delimiter).collect();
        if fields.len() < self.min_fields {
            return Err(ParseError::TooFewFields {
                expected: self.min_fields,
                found: fields.len(),
            });
        }
        let key = parse_int::<i64>(&fields, self.key_column)?;
        let kept = fields
            .iter()
            .enumerate()
            .filter(|(idx, _)| !self.drop.contains(idx))
            .map(|(_, f)| f.to_string())
            .collect();
        Ok(PrunedRecord { fields: kept, key })
    }

    fn key(&self, record: &PrunedRecord) -> i64 {
        record.key
    }

    fn render(&self, record: &PrunedRecord, out: &mut String) {
        for (i, field) in record.fields.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }
            out.push_str(field);
        }
        out.push('\n');
    }
}
