use serde::{Deserialize, Serialize};

use super::{parse_int, strip_cr, RecordSchema};
use crate::error::ParseError;

const VEHICLE_FIELDS: usize = 4;

/// One parking violation, reduced to the columns the age breakdown needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub violation_code: i32,
    pub vehicle_year: i32,
    pub issue_date: String,
    pub vehicle_age: i32,
}

/// `violation_code,vehicle_year,issue_date,vehicle_age[,...]`; columns past the
/// fourth are ignored.
#[derive(Debug, Clone)]
pub struct VehicleSchema {
    delimiter: char,
}

impl VehicleSchema {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }
}

impl Default for VehicleSchema {
    fn default() -> Self {
        Self::new(',')
    }
}

impl RecordSchema for VehicleSchema {
    type Record = VehicleRecord;

    fn parse(&self, line: &str) -> Result<VehicleRecord, ParseError> {
        let fields: Vec<&str> = strip_cr(line).split(self.delimiter).collect();
        if fields.len() < VEHICLE_FIELDS {
            return Err(ParseError::TooFewFields {
                expected: VEHICLE_FIELDS,
                found: fields.len(),
            });
        }
        Ok(VehicleRecord {
            violation_code: parse_int(&fields, 0)?,
            vehicle_year: parse_int(&fields, 1)?,
            issue_date: fields[2].to_string(),
            vehicle_age: parse_int(&fields, 3)?,
        })
    }

    fn key(&self, record: &VehicleRecord) -> i64 {
        i64::from(record.vehicle_age)
    }

    fn key_label(&self) -> &str {
        "Vehicle Age"
    }

    fn render(&self, record: &VehicleRecord, out: &mut String) {
        use std::fmt::Write;
        let d = self.delimiter;
        let _ = writeln!(
            out,
            "{}{d}{}{d}{}{d}{}",
            record.violation_code, record.vehicle_year, record.issue_date, record.vehicle_age
        );
    }
}
