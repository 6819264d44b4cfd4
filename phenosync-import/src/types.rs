//! Shared domain types and data contracts
//!
//! Entities mirror what the external breeding-data store holds. Every entity
//! carries an optional server-assigned `db_id`; reconciliation never keys on
//! it. Deduplication and cross-references use natural keys: the
//! business-meaningful name (or composite of names) of the entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Opaque tenant key; all cache and import state is partitioned by it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramId(pub String);

impl ProgramId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entity types handled by the import pipeline, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Germplasm,
    Location,
    Trial,
    Study,
    ObservationUnit,
    Dataset,
    Observation,
}

impl EntityType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Germplasm => "germplasm",
            Self::Location => "location",
            Self::Trial => "trial",
            Self::Study => "study",
            Self::ObservationUnit => "observation_unit",
            Self::Dataset => "dataset",
            Self::Observation => "observation",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Domain Entities
// ============================================================================

/// Germplasm (plant material) with recorded parentage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Germplasm {
    pub name: String,
    pub accession_number: Option<String>,
    /// Female parent germplasm name, if recorded
    pub female_parent: Option<String>,
    /// Male parent germplasm name, if recorded
    pub male_parent: Option<String>,
    pub breeding_method: Option<String>,
    pub db_id: Option<String>,
}

impl Germplasm {
    pub fn natural_key(&self) -> String {
        self.name.clone()
    }

    /// Parent names referenced by this germplasm's pedigree
    pub fn parent_names(&self) -> impl Iterator<Item = &str> {
        self.female_parent
            .as_deref()
            .into_iter()
            .chain(self.male_parent.as_deref())
    }
}

/// Field location within a program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramLocation {
    pub name: String,
    pub db_id: Option<String>,
}

impl ProgramLocation {
    pub fn natural_key(&self) -> String {
        self.name.clone()
    }
}

/// Breeding trial (experiment grouping studies)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub name: String,
    pub db_id: Option<String>,
}

impl Trial {
    pub fn natural_key(&self) -> String {
        self.name.clone()
    }
}

/// Study (one environment of a trial at one location)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub name: String,
    pub trial_name: String,
    pub location_name: String,
    pub season: Option<String>,
    pub db_id: Option<String>,
}

impl Study {
    pub fn natural_key(&self) -> String {
        self.name.clone()
    }
}

/// Observation unit (a plot/plant of one germplasm within one study)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationUnit {
    pub name: String,
    pub study_name: String,
    pub germplasm_name: String,
    pub db_id: Option<String>,
}

impl ObservationUnit {
    /// Unit names are only unique within their study
    pub fn natural_key(&self) -> String {
        composite_key(&[&self.study_name, &self.name])
    }
}

/// A single recorded value of one variable on one observation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub unit_name: String,
    pub study_name: String,
    pub variable_name: String,
    pub value: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Append-only audit trail of committed edits
    #[serde(default)]
    pub change_log: Vec<ChangeLogEntry>,
    pub db_id: Option<String>,
}

impl Observation {
    pub fn key(&self) -> ObservationKey {
        ObservationKey::new(&self.study_name, &self.unit_name, &self.variable_name)
    }
}

/// Grouping of the observation variables recorded for one study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub study_name: String,
    pub variable_names: Vec<String>,
    pub db_id: Option<String>,
}

impl Dataset {
    pub fn natural_key(&self) -> String {
        self.study_name.clone()
    }
}

/// One committed edit to an observation; entries are appended, never replaced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub prior_value: String,
    pub reason: String,
    pub actor_id: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Natural Keys
// ============================================================================

/// Join name parts into a composite natural key
///
/// Parts are joined with `\u{241F}` (unit separator) so that names containing
/// common punctuation cannot collide with a genuinely composite key.
pub fn composite_key(parts: &[&str]) -> String {
    parts.join("\u{241F}")
}

/// Identity of one observation slot: hash of (study, unit, variable)
///
/// Rows carry no remote observation id; the slot an imported value lands in
/// is inferred structurally and matched against fetched remote observations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObservationKey(String);

impl ObservationKey {
    pub fn new(study_name: &str, unit_name: &str, variable_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(study_name.as_bytes());
        hasher.update([0x1f]);
        hasher.update(unit_name.as_bytes());
        hasher.update([0x1f]);
        hasher.update(variable_name.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Upload Rows
// ============================================================================

/// One upload row: named cells plus per-row overrides
///
/// Parsing files into rows happens upstream; the pipeline receives an
/// already-parsed rows-by-named-columns structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportRow {
    /// Zero-based position in the upload, used in error reporting
    pub row_index: usize,
    /// Column name → raw cell value
    pub cells: HashMap<String, String>,
    /// Authorizes overwriting an existing differing observation value
    pub overwrite: bool,
    /// Free-form justification recorded in the change log on overwrite
    pub overwrite_reason: Option<String>,
}

impl ImportRow {
    /// Trimmed cell value, with blank treated as absent
    pub fn cell(&self, column: &str) -> Option<&str> {
        self.cells
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_key_is_stable() {
        let a = ObservationKey::new("Env1", "Plot-1", "height");
        let b = ObservationKey::new("Env1", "Plot-1", "height");
        assert_eq!(a, b);
    }

    #[test]
    fn observation_key_separates_fields() {
        // "Env1"+"1Plot" must not collide with "Env11"+"Plot"
        let a = ObservationKey::new("Env1", "1Plot", "height");
        let b = ObservationKey::new("Env11", "Plot", "height");
        assert_ne!(a, b);
    }

    #[test]
    fn unit_natural_key_scoped_by_study() {
        let unit = ObservationUnit {
            name: "Plot-1".to_string(),
            study_name: "Env1".to_string(),
            germplasm_name: "G1".to_string(),
            db_id: None,
        };
        let same_name_other_study = ObservationUnit {
            study_name: "Env2".to_string(),
            ..unit.clone()
        };
        assert_ne!(unit.natural_key(), same_name_other_study.natural_key());
    }

    #[test]
    fn blank_cells_read_as_absent() {
        let mut row = ImportRow::default();
        row.cells.insert("height".to_string(), "  ".to_string());
        row.cells.insert("weight".to_string(), "12".to_string());
        assert_eq!(row.cell("height"), None);
        assert_eq!(row.cell("weight"), Some("12"));
        assert_eq!(row.cell("missing"), None);
    }
}
