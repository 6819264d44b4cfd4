//! Dataset processor
//!
//! A dataset groups the observation variables recorded for one study, so its
//! natural key is the study name. Variable columns are every column not
//! claimed by an entity schema. An existing dataset is left as a no-op;
//! only observation reconciliation may mutate stored records.

use crate::error::ImportResult;
use crate::pipeline::context::ImportContext;
use crate::pipeline::pending::PendingImportObject;
use crate::pipeline::processor::Processor;
use crate::pipeline::processors::create_in_batches;
use crate::pipeline::schema::{columns, variable_columns};
use crate::store::{search_all, EntityRecord, ExternalStore, SearchFilter};
use crate::types::{Dataset, EntityType};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct DatasetProcessor;

#[async_trait]
impl Processor for DatasetProcessor {
    fn entity_type(&self) -> EntityType {
        EntityType::Dataset
    }

    async fn fetch_existing(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        let wanted: BTreeSet<String> = ctx
            .rows
            .iter()
            .filter(|row| !variable_columns(row).is_empty())
            .filter_map(|row| row.cell(columns::ENVIRONMENT))
            .map(str::to_string)
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let snapshot = Arc::clone(&ctx.snapshot);
        let mut missing = Vec::new();
        for study in wanted {
            match snapshot.datasets.get(&study) {
                Some(found) => {
                    ctx.datasets
                        .insert(study, PendingImportObject::existing(found.clone()));
                }
                None => missing.push(study),
            }
        }

        if !missing.is_empty() {
            let records = search_all(
                store,
                &ctx.program,
                EntityType::Dataset,
                &SearchFilter::by_studies(missing),
            )
            .await?;
            for record in records {
                if let Some(found) = record.into_dataset() {
                    ctx.datasets
                        .insert(found.natural_key(), PendingImportObject::existing(found));
                }
            }
        }
        Ok(())
    }

    fn map_rows(&self, ctx: &mut ImportContext) -> ImportResult<()> {
        let rows = std::mem::take(&mut ctx.rows);
        for (index, row) in rows.iter().enumerate() {
            let variables = variable_columns(row);
            if variables.is_empty() {
                continue;
            }
            let Some(study) = row.cell(columns::ENVIRONMENT) else {
                continue;
            };
            let key = study.to_string();

            let pending = ctx.datasets.entry(key.clone()).or_insert_with(|| {
                PendingImportObject::new_object(Dataset {
                    study_name: key.clone(),
                    variable_names: Vec::new(),
                    db_id: None,
                })
            });
            // Only NEW datasets collect variables; an existing dataset's
            // variable list belongs to the store
            if pending.is_new() {
                for variable in variables {
                    if !pending
                        .object
                        .variable_names
                        .iter()
                        .any(|known| known == variable)
                    {
                        pending.object.variable_names.push(variable.to_string());
                    }
                }
                pending.object.variable_names.sort_unstable();
            }
            ctx.row_links[index].dataset = Some(key);
        }
        ctx.rows = rows;
        Ok(())
    }

    fn validate_dependencies(&self, ctx: &mut ImportContext) {
        for index in 0..ctx.row_links.len() {
            let Some(dataset_key) = ctx.row_links[index].dataset.clone() else {
                continue;
            };
            if !ctx.studies.contains_key(&dataset_key) {
                ctx.add_row_error(
                    index,
                    EntityType::Dataset,
                    Some(columns::ENVIRONMENT),
                    format!("Study '{}' was not resolved for this dataset", dataset_key),
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
            .datasets
            .iter()
            .filter(|(_, pending)| pending.is_new())
            .map(|(key, _)| key.clone())
            .collect();
        if new_keys.is_empty() {
            return Ok(());
        }

        let records: Vec<EntityRecord> = new_keys
            .iter()
            .filter_map(|key| ctx.datasets.get(key))
            .map(|pending| EntityRecord::Dataset(pending.object.clone()))
            .collect();
        let created = create_in_batches(
            store,
            &ctx.program,
            EntityType::Dataset,
            records,
            ctx.post_batch_size,
        )
        .await?;

        for (key, record) in new_keys.iter().zip(created) {
            if let (Some(pending), Some(db_id)) = (ctx.datasets.get_mut(key), record.db_id()) {
                pending.object.db_id = Some(db_id.to_string());
            }
        }
        Ok(())
    }
}
