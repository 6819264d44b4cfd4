//! Location processor
//!
//! Locations have no dependencies of their own; studies reference them by
//! name.

use crate::error::ImportResult;
use crate::pipeline::context::ImportContext;
use crate::pipeline::pending::PendingImportObject;
use crate::pipeline::processor::Processor;
use crate::pipeline::processors::create_in_batches;
use crate::pipeline::schema::columns;
use crate::store::{search_all, EntityRecord, ExternalStore, SearchFilter};
use crate::types::{EntityType, ProgramLocation};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct LocationProcessor;

#[async_trait]
impl Processor for LocationProcessor {
    fn entity_type(&self) -> EntityType {
        EntityType::Location
    }

    async fn fetch_existing(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        let wanted: BTreeSet<String> = ctx
            .rows
            .iter()
            .filter_map(|row| row.cell(columns::LOCATION))
            .map(str::to_string)
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let snapshot = Arc::clone(&ctx.snapshot);
        let mut missing = Vec::new();
        for name in wanted {
            match snapshot.locations.get(&name) {
                Some(found) => {
                    ctx.locations
                        .insert(name, PendingImportObject::existing(found.clone()));
                }
                None => missing.push(name),
            }
        }

        if !missing.is_empty() {
            let records = search_all(
                store,
                &ctx.program,
                EntityType::Location,
                &SearchFilter::by_names(missing),
            )
            .await?;
            for record in records {
                if let Some(found) = record.into_location() {
                    ctx.locations
                        .insert(found.natural_key(), PendingImportObject::existing(found));
                }
            }
        }
        Ok(())
    }

    fn map_rows(&self, ctx: &mut ImportContext) -> ImportResult<()> {
        let rows = std::mem::take(&mut ctx.rows);
        for (index, row) in rows.iter().enumerate() {
            let Some(name) = row.cell(columns::LOCATION) else {
                continue;
            };
            let key = name.to_string();
            ctx.locations.entry(key.clone()).or_insert_with(|| {
                PendingImportObject::new_object(ProgramLocation {
                    name: key.clone(),
                    db_id: None,
                })
            });
            ctx.row_links[index].location = Some(key);
        }
        ctx.rows = rows;
        Ok(())
    }

    fn validate_dependencies(&self, _ctx: &mut ImportContext) {}

    async fn post_data(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        let new_keys: Vec<String> = ctx
            .locations
            .iter()
            .filter(|(_, pending)| pending.is_new())
            .map(|(key, _)| key.clone())
            .collect();
        if new_keys.is_empty() {
            return Ok(());
        }

        let records: Vec<EntityRecord> = new_keys
            .iter()
            .filter_map(|key| ctx.locations.get(key))
            .map(|pending| EntityRecord::Location(pending.object.clone()))
            .collect();
        let created = create_in_batches(
            store,
            &ctx.program,
            EntityType::Location,
            records,
            ctx.post_batch_size,
        )
        .await?;

        for (key, record) in new_keys.iter().zip(created) {
            if let (Some(pending), Some(db_id)) = (ctx.locations.get_mut(key), record.db_id()) {
                pending.object.db_id = Some(db_id.to_string());
            }
        }
        Ok(())
    }
}
