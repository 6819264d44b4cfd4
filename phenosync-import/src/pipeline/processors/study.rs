//! Study processor
//!
//! A study is one environment of a trial at one location; rows name it in
//! the Environment column. NEW studies require the trial and location
//! columns so the reference can be staged or matched.

use crate::error::ImportResult;
use crate::pipeline::context::ImportContext;
use crate::pipeline::pending::PendingImportObject;
use crate::pipeline::processor::Processor;
use crate::pipeline::processors::create_in_batches;
use crate::pipeline::schema::{columns, extract_fields, ColumnSpec};
use crate::store::{search_all, EntityRecord, ExternalStore, SearchFilter};
use crate::types::{EntityType, Study};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

const SCHEMA: &[ColumnSpec] = &[
    ColumnSpec::required(columns::ENVIRONMENT),
    ColumnSpec::required(columns::TRIAL),
    ColumnSpec::required(columns::LOCATION),
    ColumnSpec::optional(columns::SEASON),
];

pub struct StudyProcessor;

#[async_trait]
impl Processor for StudyProcessor {
    fn entity_type(&self) -> EntityType {
        EntityType::Study
    }

    async fn fetch_existing(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        let wanted: BTreeSet<String> = ctx
            .rows
            .iter()
            .filter_map(|row| row.cell(columns::ENVIRONMENT))
            .map(str::to_string)
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let snapshot = Arc::clone(&ctx.snapshot);
        let mut missing = Vec::new();
        for name in wanted {
            match snapshot.studies.get(&name) {
                Some(found) => {
                    ctx.studies
                        .insert(name, PendingImportObject::existing(found.clone()));
                }
                None => missing.push(name),
            }
        }

        if !missing.is_empty() {
            let records = search_all(
                store,
                &ctx.program,
                EntityType::Study,
                &SearchFilter::by_names(missing),
            )
            .await?;
            for record in records {
                if let Some(found) = record.into_study() {
                    ctx.studies
                        .insert(found.natural_key(), PendingImportObject::existing(found));
                }
            }
        }
        Ok(())
    }

    fn map_rows(&self, ctx: &mut ImportContext) -> ImportResult<()> {
        let rows = std::mem::take(&mut ctx.rows);
        for (index, row) in rows.iter().enumerate() {
            let Some(name) = row.cell(columns::ENVIRONMENT) else {
                continue;
            };
            let key = name.to_string();

            if !ctx.studies.contains_key(&key) {
                if let Some(fields) =
                    extract_fields(row, EntityType::Study, SCHEMA, &mut ctx.row_errors)
                {
                    let object = Study {
                        name: key.clone(),
                        trial_name: fields[columns::TRIAL].to_string(),
                        location_name: fields[columns::LOCATION].to_string(),
                        season: fields.get(columns::SEASON).map(|v| v.to_string()),
                        db_id: None,
                    };
                    ctx.studies
                        .insert(key.clone(), PendingImportObject::new_object(object));
                }
            }
            ctx.row_links[index].study = Some(key);
        }
        ctx.rows = rows;
        Ok(())
    }

    fn validate_dependencies(&self, ctx: &mut ImportContext) {
        // Every NEW study's trial and location must be staged by an earlier
        // processor (EXISTING or NEW); report against the rows that name it
        let mut missing: Vec<(String, &'static str, String)> = Vec::new();
        for (key, pending) in &ctx.studies {
            if !pending.is_new() {
                continue;
            }
            if !ctx.trials.contains_key(&pending.object.trial_name) {
                missing.push((
                    key.clone(),
                    columns::TRIAL,
                    format!("Trial '{}' was not resolved", pending.object.trial_name),
                ));
            }
            if !ctx.locations.contains_key(&pending.object.location_name) {
                missing.push((
                    key.clone(),
                    columns::LOCATION,
                    format!("Location '{}' was not resolved", pending.object.location_name),
                ));
            }
        }

        for (study_key, field, message) in missing {
            for index in rows_naming_study(ctx, &study_key) {
                ctx.row_errors.push(crate::error::RowError::new(
                    index,
                    EntityType::Study,
                    Some(field),
                    message.clone(),
                ));
            }
        }
    }

    async fn post_data(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        let new_keys: Vec<String> = ctx
            .studies
            .iter()
            .filter(|(_, pending)| pending.is_new())
            .map(|(key, _)| key.clone())
            .collect();
        if new_keys.is_empty() {
            return Ok(());
        }

        let records: Vec<EntityRecord> = new_keys
            .iter()
            .filter_map(|key| ctx.studies.get(key))
            .map(|pending| EntityRecord::Study(pending.object.clone()))
            .collect();
        let created = create_in_batches(
            store,
            &ctx.program,
            EntityType::Study,
            records,
            ctx.post_batch_size,
        )
        .await?;

        for (key, record) in new_keys.iter().zip(created) {
            if let (Some(pending), Some(db_id)) = (ctx.studies.get_mut(key), record.db_id()) {
                pending.object.db_id = Some(db_id.to_string());
            }
        }
        Ok(())
    }
}

fn rows_naming_study(ctx: &ImportContext, study_key: &str) -> Vec<usize> {
    ctx.row_links
        .iter()
        .enumerate()
        .filter(|(_, links)| links.study.as_deref() == Some(study_key))
        .map(|(index, _)| index)
        .collect()
}
