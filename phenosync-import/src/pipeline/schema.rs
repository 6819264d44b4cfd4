//! Declarative column schema for row-to-entity mapping
//!
//! Each entity type declares an ordered list of column descriptors; one
//! generic extraction function interprets them, accumulating
//! missing-required-column errors instead of failing fast. Any column not
//! claimed by a descriptor is treated as an observation variable column.

use crate::error::RowError;
use crate::types::{EntityType, ImportRow};
use std::collections::HashMap;

/// Well-known upload column headers
pub mod columns {
    pub const GERMPLASM_NAME: &str = "Germplasm Name";
    pub const ACCESSION_NUMBER: &str = "Accession Number";
    pub const FEMALE_PARENT: &str = "Female Parent";
    pub const MALE_PARENT: &str = "Male Parent";
    pub const BREEDING_METHOD: &str = "Breeding Method";
    pub const TRIAL: &str = "Trial";
    pub const ENVIRONMENT: &str = "Environment";
    pub const LOCATION: &str = "Location";
    pub const SEASON: &str = "Season";
    pub const OBS_UNIT_ID: &str = "Obs Unit ID";
    pub const TIMESTAMP: &str = "Timestamp";
}

/// One column descriptor: header name and whether a value must be present
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub column: &'static str,
    pub required: bool,
}

impl ColumnSpec {
    pub const fn required(column: &'static str) -> Self {
        Self {
            column,
            required: true,
        }
    }

    pub const fn optional(column: &'static str) -> Self {
        Self {
            column,
            required: false,
        }
    }
}

/// Extracted trimmed values, keyed by column header
pub type ExtractedFields<'r> = HashMap<&'static str, &'r str>;

/// Interpret a schema against one row
///
/// Returns `None` when any required column is blank or absent, after pushing
/// one error per missing column; optional blank columns are simply omitted
/// from the result.
pub fn extract_fields<'r>(
    row: &'r ImportRow,
    entity: EntityType,
    specs: &[ColumnSpec],
    errors: &mut Vec<RowError>,
) -> Option<ExtractedFields<'r>> {
    let mut fields = ExtractedFields::new();
    let mut complete = true;

    for spec in specs {
        match row.cell(spec.column) {
            Some(value) => {
                fields.insert(spec.column, value);
            }
            None if spec.required => {
                errors.push(RowError::new(
                    row.row_index,
                    entity,
                    Some(spec.column),
                    format!("Required column '{}' is blank", spec.column),
                ));
                complete = false;
            }
            None => {}
        }
    }

    complete.then_some(fields)
}

/// All headers claimed by entity schemas; everything else on a row is an
/// observation variable column
pub fn known_columns() -> &'static [&'static str] {
    &[
        columns::GERMPLASM_NAME,
        columns::ACCESSION_NUMBER,
        columns::FEMALE_PARENT,
        columns::MALE_PARENT,
        columns::BREEDING_METHOD,
        columns::TRIAL,
        columns::ENVIRONMENT,
        columns::LOCATION,
        columns::SEASON,
        columns::OBS_UNIT_ID,
        columns::TIMESTAMP,
    ]
}

/// Variable columns present on a row, in stable (sorted) order
pub fn variable_columns(row: &ImportRow) -> Vec<&str> {
    let known = known_columns();
    let mut variables: Vec<&str> = row
        .cells
        .keys()
        .map(String::as_str)
        .filter(|column| !known.contains(column))
        .collect();
    variables.sort_unstable();
    variables
}
