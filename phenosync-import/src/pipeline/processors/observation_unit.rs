//! Observation unit processor
//!
//! Unit names are only unique within a study, so the natural key is the
//! (study, unit) composite. Rows without an Obs Unit ID column stage no
//! unit (germplasm-only uploads).

use crate::error::ImportResult;
use crate::pipeline::context::ImportContext;
use crate::pipeline::pending::PendingImportObject;
use crate::pipeline::processor::Processor;
use crate::pipeline::processors::create_in_batches;
use crate::pipeline::schema::{columns, extract_fields, ColumnSpec};
use crate::store::{search_all, EntityRecord, ExternalStore, SearchFilter};
use crate::types::{composite_key, EntityType, ObservationUnit};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

const SCHEMA: &[ColumnSpec] = &[
    ColumnSpec::required(columns::OBS_UNIT_ID),
    ColumnSpec::required(columns::ENVIRONMENT),
    ColumnSpec::required(columns::GERMPLASM_NAME),
];

pub struct ObservationUnitProcessor;

#[async_trait]
impl Processor for ObservationUnitProcessor {
    fn entity_type(&self) -> EntityType {
        EntityType::ObservationUnit
    }

    async fn fetch_existing(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        // Natural keys referenced by this batch
        let mut referenced: BTreeSet<String> = BTreeSet::new();
        let mut study_names: BTreeSet<String> = BTreeSet::new();
        for row in &ctx.rows {
            if let (Some(study), Some(unit)) = (
                row.cell(columns::ENVIRONMENT),
                row.cell(columns::OBS_UNIT_ID),
            ) {
                referenced.insert(composite_key(&[study, unit]));
                study_names.insert(study.to_string());
            }
        }
        if referenced.is_empty() {
            return Ok(());
        }

        let snapshot = Arc::clone(&ctx.snapshot);
        let mut any_missing = false;
        for key in &referenced {
            match snapshot.observation_units.get(key) {
                Some(found) => {
                    ctx.observation_units
                        .insert(key.clone(), PendingImportObject::existing(found.clone()));
                }
                None => any_missing = true,
            }
        }

        // Units are searched by study scope; keep only the keys the batch
        // actually references
        if any_missing {
            let records = search_all(
                store,
                &ctx.program,
                EntityType::ObservationUnit,
                &SearchFilter::by_studies(study_names),
            )
            .await?;
            for record in records {
                if let Some(found) = record.into_observation_unit() {
                    let key = found.natural_key();
                    if referenced.contains(&key) {
                        ctx.observation_units
                            .insert(key, PendingImportObject::existing(found));
                    }
                }
            }
        }
        Ok(())
    }

    fn map_rows(&self, ctx: &mut ImportContext) -> ImportResult<()> {
        let rows = std::mem::take(&mut ctx.rows);
        for (index, row) in rows.iter().enumerate() {
            if row.cell(columns::OBS_UNIT_ID).is_none() {
                continue;
            }
            let Some(fields) =
                extract_fields(row, EntityType::ObservationUnit, SCHEMA, &mut ctx.row_errors)
            else {
                continue;
            };

            let study = fields[columns::ENVIRONMENT];
            let unit = fields[columns::OBS_UNIT_ID];
            let germplasm = fields[columns::GERMPLASM_NAME];
            let key = composite_key(&[study, unit]);

            match ctx.observation_units.get(&key) {
                Some(pending) => {
                    // Re-referencing an existing unit with a different
                    // germplasm is a data problem, not a new unit
                    if pending.object.germplasm_name != germplasm {
                        ctx.add_row_error(
                            index,
                            EntityType::ObservationUnit,
                            Some(columns::GERMPLASM_NAME),
                            format!(
                                "Unit '{}' is recorded for germplasm '{}', not '{}'",
                                unit, pending.object.germplasm_name, germplasm
                            ),
                        );
                    }
                }
                None => {
                    let object = ObservationUnit {
                        name: unit.to_string(),
                        study_name: study.to_string(),
                        germplasm_name: germplasm.to_string(),
                        db_id: None,
                    };
                    ctx.observation_units
                        .insert(key.clone(), PendingImportObject::new_object(object));
                }
            }
            ctx.row_links[index].observation_unit = Some(key);
        }
        ctx.rows = rows;
        Ok(())
    }

    fn validate_dependencies(&self, ctx: &mut ImportContext) {
        for index in 0..ctx.row_links.len() {
            let Some(unit_key) = ctx.row_links[index].observation_unit.clone() else {
                continue;
            };
            let Some(pending) = ctx.observation_units.get(&unit_key) else {
                continue;
            };
            let study = pending.object.study_name.clone();
            let germplasm = pending.object.germplasm_name.clone();

            if !ctx.studies.contains_key(&study) {
                ctx.add_row_error(
                    index,
                    EntityType::ObservationUnit,
                    Some(columns::ENVIRONMENT),
                    format!("Study '{}' was not resolved for this unit", study),
                );
            }
            if !ctx.germplasm.contains_key(&germplasm) {
                ctx.add_row_error(
                    index,
                    EntityType::ObservationUnit,
                    Some(columns::GERMPLASM_NAME),
                    format!("Germplasm '{}' was not resolved for this unit", germplasm),
                );
            }
        }
    }

    async fn post_data(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        let new_keys: Vec<String> = ctx
            .observation_units
            .iter()
            .filter(|(_, pending)| pending.is_new())
            .map(|(key, _)| key.clone())
            .collect();
        if new_keys.is_empty() {
            return Ok(());
        }

        let records: Vec<EntityRecord> = new_keys
            .iter()
            .filter_map(|key| ctx.observation_units.get(key))
            .map(|pending| EntityRecord::ObservationUnit(pending.object.clone()))
            .collect();
        let created = create_in_batches(
            store,
            &ctx.program,
            EntityType::ObservationUnit,
            records,
            ctx.post_batch_size,
        )
        .await?;

        for (key, record) in new_keys.iter().zip(created) {
            if let (Some(pending), Some(db_id)) =
                (ctx.observation_units.get_mut(key), record.db_id())
            {
                pending.object.db_id = Some(db_id.to_string());
            }
        }
        Ok(())
    }
}
