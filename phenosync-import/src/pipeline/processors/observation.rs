//! Observation processor
//!
//! Runs last: every other entity a slot depends on is already staged. The
//! fetch phase pulls remote observations for the batch's studies into a raw
//! side map; only the (row, variable column) pairs the batch actually names
//! become pending objects, via [`reconcile`].

use crate::error::ImportResult;
use crate::pipeline::context::ImportContext;
use crate::pipeline::pending::PendingState;
use crate::pipeline::processor::Processor;
use crate::pipeline::processors::create_in_batches;
use crate::pipeline::reconcile::{reconcile, ObservationInput, Reconciliation};
use crate::pipeline::schema::{columns, variable_columns};
use crate::store::{search_all, EntityRecord, ExternalStore, SearchFilter};
use crate::types::{composite_key, EntityType, ObservationKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

pub struct ObservationProcessor;

#[async_trait]
impl Processor for ObservationProcessor {
    fn entity_type(&self) -> EntityType {
        EntityType::Observation
    }

    async fn fetch_existing(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        let study_names: BTreeSet<String> = ctx
            .rows
            .iter()
            .filter(|row| {
                row.cell(columns::OBS_UNIT_ID).is_some() && !variable_columns(row).is_empty()
            })
            .filter_map(|row| row.cell(columns::ENVIRONMENT))
            .map(str::to_string)
            .collect();
        if study_names.is_empty() {
            return Ok(());
        }

        let records = search_all(
            store,
            &ctx.program,
            EntityType::Observation,
            &SearchFilter::by_studies(study_names),
        )
        .await?;
        for record in records {
            if let Some(found) = record.into_observation() {
                ctx.fetched_observations.insert(found.key(), found);
            }
        }
        Ok(())
    }

    fn map_rows(&self, ctx: &mut ImportContext) -> ImportResult<()> {
        let rows = std::mem::take(&mut ctx.rows);
        for (index, row) in rows.iter().enumerate() {
            let (Some(study), Some(unit)) = (
                row.cell(columns::ENVIRONMENT),
                row.cell(columns::OBS_UNIT_ID),
            ) else {
                continue;
            };
            let variables = variable_columns(row);
            if variables.is_empty() {
                continue;
            }

            let timestamp = match parse_timestamp(row.cell(columns::TIMESTAMP)) {
                Ok(parsed) => parsed,
                Err(message) => {
                    ctx.add_row_error(
                        index,
                        EntityType::Observation,
                        Some(columns::TIMESTAMP),
                        message,
                    );
                    continue;
                }
            };

            for variable in variables {
                let key = ObservationKey::new(study, unit, variable);
                let input = ObservationInput {
                    study_name: study,
                    unit_name: unit,
                    variable_name: variable,
                    value: row.cell(variable),
                    timestamp,
                    overwrite: row.overwrite,
                    overwrite_reason: row.overwrite_reason.as_deref(),
                    actor_id: &ctx.actor_id,
                };

                // Two rows may legitimately repeat an identical slot; a
                // conflicting repeat is a data problem on the later row
                if let Some(staged) = ctx.observations.get(&key) {
                    let repeated = input.value;
                    if repeated.is_some() && repeated != Some(staged.object.value.as_str()) {
                        ctx.add_row_error(
                            index,
                            EntityType::Observation,
                            Some(variable),
                            format!(
                                "Unit '{}', variable '{}' appears earlier in this upload with a different value",
                                unit, variable
                            ),
                        );
                    }
                    continue;
                }

                match reconcile(&input, ctx.fetched_observations.get(&key)) {
                    Ok(Reconciliation::Skip) => {}
                    Ok(Reconciliation::Staged(pending)) => {
                        ctx.observations.insert(key.clone(), pending);
                        ctx.row_links[index].observations.push(key);
                    }
                    Ok(Reconciliation::Blocked { message }) => {
                        ctx.add_row_error(index, EntityType::Observation, Some(variable), message);
                    }
                    Err(error) => ctx.entity_errors.push(error),
                }
            }
        }
        ctx.rows = rows;
        Ok(())
    }

    fn validate_dependencies(&self, ctx: &mut ImportContext) {
        for index in 0..ctx.row_links.len() {
            if ctx.row_links[index].observations.is_empty() {
                continue;
            }
            let keys: Vec<ObservationKey> = ctx.row_links[index].observations.clone();
            for key in keys {
                let Some(pending) = ctx.observations.get(&key) else {
                    continue;
                };
                let unit_key = composite_key(&[
                    &pending.object.study_name,
                    &pending.object.unit_name,
                ]);
                let variable = pending.object.variable_name.clone();
                let unit_name = pending.object.unit_name.clone();

                if !ctx.observation_units.contains_key(&unit_key) {
                    ctx.add_row_error(
                        index,
                        EntityType::Observation,
                        Some(variable.as_str()),
                        format!("Unit '{}' was not resolved for this observation", unit_name),
                    );
                }
            }
        }
    }

    async fn post_data(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        let new_keys: Vec<ObservationKey> = ctx
            .observations
            .iter()
            .filter(|(_, pending)| pending.is_new())
            .map(|(key, _)| key.clone())
            .collect();

        if !new_keys.is_empty() {
            let records: Vec<EntityRecord> = new_keys
                .iter()
                .filter_map(|key| ctx.observations.get(key))
                .map(|pending| EntityRecord::Observation(pending.object.clone()))
                .collect();
            let created = create_in_batches(
                store,
                &ctx.program,
                EntityType::Observation,
                records,
                ctx.post_batch_size,
            )
            .await?;
            for (key, record) in new_keys.iter().zip(created) {
                if let (Some(pending), Some(db_id)) =
                    (ctx.observations.get_mut(key), record.db_id())
                {
                    pending.object.db_id = Some(db_id.to_string());
                }
            }
        }

        // Authorized edits go one record at a time so a rejected update names
        // its slot
        let mutated_keys: Vec<ObservationKey> = ctx
            .observations
            .iter()
            .filter(|(_, pending)| pending.state() == PendingState::Mutated)
            .map(|(key, _)| key.clone())
            .collect();
        for key in mutated_keys {
            let Some(pending) = ctx.observations.get(&key) else {
                continue;
            };
            let Some(db_id) = pending.object.db_id.clone() else {
                tracing::warn!(
                    unit = %pending.object.unit_name,
                    variable = %pending.object.variable_name,
                    "mutated observation has no stored id; skipping update"
                );
                continue;
            };
            store
                .update(
                    &ctx.program,
                    EntityType::Observation,
                    &db_id,
                    EntityRecord::Observation(pending.object.clone()),
                )
                .await?;
        }
        Ok(())
    }
}

fn parse_timestamp(cell: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match cell {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|_| format!("Timestamp '{}' is not a valid RFC 3339 datetime", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_timestamp_is_none() {
        assert_eq!(parse_timestamp(None).unwrap(), None);
    }

    #[test]
    fn rfc3339_timestamp_parses_to_utc() {
        let parsed = parse_timestamp(Some("2026-03-01T12:00:00+02:00"))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        let err = parse_timestamp(Some("yesterday")).unwrap_err();
        assert!(err.contains("yesterday"));
    }
}
