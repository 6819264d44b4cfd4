//! Observation reconciliation
//!
//! Decides NEW / EXISTING(no-op) / MUTATED for each (row, variable column)
//! pair by structural identity: rows carry no remote observation id, so the
//! slot is the [`ObservationKey`] hash of (study, unit, variable), matched
//! against observations already fetched for the batch's studies.
//!
//! Decision table:
//!
//! | existing? | import value | overwrite | outcome                        |
//! |-----------|--------------|-----------|--------------------------------|
//! | –         | blank        | –         | nothing staged                 |
//! | no        | present      | –         | NEW                            |
//! | yes       | equal¹       | –         | EXISTING (no-op)               |
//! | yes       | differs      | true      | MUTATED + one change-log entry |
//! | yes       | differs      | false     | blocked: named row error       |
//!
//! ¹ equal value and the import timestamp equal to the stored one or absent.

use crate::error::ImportError;
use crate::pipeline::pending::PendingImportObject;
use crate::types::{ChangeLogEntry, Observation};
use chrono::{DateTime, Utc};

/// One (row, variable column) pair under reconciliation
#[derive(Debug)]
pub struct ObservationInput<'a> {
    pub study_name: &'a str,
    pub unit_name: &'a str,
    pub variable_name: &'a str,
    pub value: Option<&'a str>,
    pub timestamp: Option<DateTime<Utc>>,
    pub overwrite: bool,
    pub overwrite_reason: Option<&'a str>,
    pub actor_id: &'a str,
}

/// Reconciliation outcome for one slot
#[derive(Debug)]
pub enum Reconciliation {
    /// Blank import value: nothing staged for this slot
    Skip,
    /// Staged pending object (NEW, EXISTING, or MUTATED)
    Staged(PendingImportObject<Observation>),
    /// Stored value differs and the overwrite was not authorized
    Blocked { message: String },
}

/// Reconcile one import slot against the fetched remote observation
pub fn reconcile(
    input: &ObservationInput<'_>,
    existing: Option<&Observation>,
) -> Result<Reconciliation, ImportError> {
    let Some(value) = input.value else {
        // Blank never creates and never deletes
        return Ok(Reconciliation::Skip);
    };

    let Some(stored) = existing else {
        return Ok(Reconciliation::Staged(PendingImportObject::new_object(
            Observation {
                unit_name: input.unit_name.to_string(),
                study_name: input.study_name.to_string(),
                variable_name: input.variable_name.to_string(),
                value: value.to_string(),
                timestamp: input.timestamp,
                change_log: Vec::new(),
                db_id: None,
            },
        )));
    };

    if value == stored.value && timestamp_unchanged(input.timestamp, stored.timestamp) {
        return Ok(Reconciliation::Staged(PendingImportObject::existing(
            stored.clone(),
        )));
    }

    if !input.overwrite {
        return Ok(Reconciliation::Blocked {
            message: format!(
                "Value for unit '{}', variable '{}' differs from the stored observation; overwrite not authorized",
                input.unit_name, input.variable_name
            ),
        });
    }

    // Authorized edit: copy the stored observation, apply the new value and
    // timestamp, and append exactly one change-log entry
    let mut edited = stored.clone();
    edited.value = value.to_string();
    edited.timestamp = input.timestamp.or(stored.timestamp);
    edited.change_log.push(ChangeLogEntry {
        prior_value: stored.value.clone(),
        reason: input.overwrite_reason.unwrap_or_default().to_string(),
        actor_id: input.actor_id.to_string(),
        timestamp: Utc::now(),
    });

    let mut pending = PendingImportObject::existing(stored.clone());
    pending.mutate(edited)?;
    Ok(Reconciliation::Staged(pending))
}

/// An absent import timestamp never counts as a change
fn timestamp_unchanged(imported: Option<DateTime<Utc>>, stored: Option<DateTime<Utc>>) -> bool {
    match imported {
        None => true,
        Some(ts) => stored == Some(ts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::pending::PendingState;
    use chrono::TimeZone;

    fn stored(value: &str) -> Observation {
        Observation {
            unit_name: "Plot-1".to_string(),
            study_name: "Env1".to_string(),
            variable_name: "height".to_string(),
            value: value.to_string(),
            timestamp: None,
            change_log: Vec::new(),
            db_id: Some("obs-1".to_string()),
        }
    }

    fn input<'a>(value: Option<&'a str>, overwrite: bool, reason: Option<&'a str>) -> ObservationInput<'a> {
        ObservationInput {
            study_name: "Env1",
            unit_name: "Plot-1",
            variable_name: "height",
            value,
            timestamp: None,
            overwrite,
            overwrite_reason: reason,
            actor_id: "tester",
        }
    }

    #[test]
    fn blank_value_without_existing_stages_nothing() {
        let outcome = reconcile(&input(None, false, None), None).unwrap();
        assert!(matches!(outcome, Reconciliation::Skip));
    }

    #[test]
    fn blank_value_never_deletes_existing() {
        let existing = stored("10");
        let outcome = reconcile(&input(None, false, None), Some(&existing)).unwrap();
        assert!(matches!(outcome, Reconciliation::Skip));
    }

    #[test]
    fn present_value_without_existing_is_new() {
        let outcome = reconcile(&input(Some("10"), false, None), None).unwrap();
        match outcome {
            Reconciliation::Staged(pending) => {
                assert_eq!(pending.state(), PendingState::New);
                assert_eq!(pending.object.value, "10");
                assert!(pending.object.change_log.is_empty());
            }
            other => panic!("expected NEW, got {:?}", other),
        }
    }

    #[test]
    fn equal_value_is_a_noop() {
        let existing = stored("10");
        let outcome = reconcile(&input(Some("10"), false, None), Some(&existing)).unwrap();
        match outcome {
            Reconciliation::Staged(pending) => {
                assert_eq!(pending.state(), PendingState::Existing);
                assert!(pending.object.change_log.is_empty());
            }
            other => panic!("expected EXISTING, got {:?}", other),
        }
    }

    #[test]
    fn authorized_overwrite_logs_exactly_one_entry() {
        let existing = stored("10");
        let outcome = reconcile(
            &input(Some("12"), true, Some("corrected misread")),
            Some(&existing),
        )
        .unwrap();
        match outcome {
            Reconciliation::Staged(pending) => {
                assert_eq!(pending.state(), PendingState::Mutated);
                assert_eq!(pending.object.value, "12");
                assert_eq!(pending.object.change_log.len(), 1);
                let entry = &pending.object.change_log[0];
                assert_eq!(entry.prior_value, "10");
                assert_eq!(entry.reason, "corrected misread");
                assert_eq!(entry.actor_id, "tester");
            }
            other => panic!("expected MUTATED, got {:?}", other),
        }
    }

    #[test]
    fn overwrite_appends_to_an_existing_change_log() {
        let mut existing = stored("10");
        existing.change_log.push(ChangeLogEntry {
            prior_value: "8".to_string(),
            reason: "earlier fix".to_string(),
            actor_id: "someone".to_string(),
            timestamp: Utc::now(),
        });
        let outcome =
            reconcile(&input(Some("12"), true, Some("again")), Some(&existing)).unwrap();
        match outcome {
            Reconciliation::Staged(pending) => {
                // Appended, never replaced
                assert_eq!(pending.object.change_log.len(), 2);
                assert_eq!(pending.object.change_log[1].prior_value, "10");
            }
            other => panic!("expected MUTATED, got {:?}", other),
        }
    }

    #[test]
    fn unauthorized_differing_value_is_blocked() {
        let existing = stored("10");
        let outcome = reconcile(&input(Some("12"), false, None), Some(&existing)).unwrap();
        match outcome {
            Reconciliation::Blocked { message } => {
                assert!(message.contains("Plot-1"));
                assert!(message.contains("height"));
            }
            other => panic!("expected Blocked, got {:?}", other),
        }
    }

    #[test]
    fn timestamp_change_alone_requires_overwrite() {
        let mut existing = stored("10");
        existing.timestamp = Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let mut imported = input(Some("10"), false, None);
        imported.timestamp = Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());

        let outcome = reconcile(&imported, Some(&existing)).unwrap();
        assert!(matches!(outcome, Reconciliation::Blocked { .. }));
    }
}
