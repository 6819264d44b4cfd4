//! Germplasm processor
//!
//! Rows may reference other germplasm in the same batch as female/male
//! parents, so the post phase orders creation by pedigree layering. A
//! pedigree cycle blocks every germplasm create without aborting sibling
//! entity types.

use crate::error::ImportResult;
use crate::pipeline::context::ImportContext;
use crate::pipeline::pedigree::{order_germplasm, PedigreeOrder};
use crate::pipeline::pending::PendingImportObject;
use crate::pipeline::processor::Processor;
use crate::pipeline::processors::create_in_batches;
use crate::pipeline::schema::{columns, extract_fields, ColumnSpec};
use crate::store::{search_all, EntityRecord, ExternalStore, SearchFilter};
use crate::types::{EntityType, Germplasm};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

const SCHEMA: &[ColumnSpec] = &[
    ColumnSpec::required(columns::GERMPLASM_NAME),
    ColumnSpec::optional(columns::ACCESSION_NUMBER),
    ColumnSpec::optional(columns::FEMALE_PARENT),
    ColumnSpec::optional(columns::MALE_PARENT),
    ColumnSpec::optional(columns::BREEDING_METHOD),
];

pub struct GermplasmProcessor;

#[async_trait]
impl Processor for GermplasmProcessor {
    fn entity_type(&self) -> EntityType {
        EntityType::Germplasm
    }

    async fn fetch_existing(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        // Referenced names: every row's own germplasm plus its parents
        let mut wanted: BTreeSet<String> = BTreeSet::new();
        for row in &ctx.rows {
            for column in [
                columns::GERMPLASM_NAME,
                columns::FEMALE_PARENT,
                columns::MALE_PARENT,
            ] {
                if let Some(name) = row.cell(column) {
                    wanted.insert(name.to_string());
                }
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        // Snapshot hits first, then one store search for the rest
        let snapshot = Arc::clone(&ctx.snapshot);
        let mut missing = Vec::new();
        for name in wanted {
            match snapshot.germplasm.get(&name) {
                Some(found) => {
                    ctx.germplasm
                        .insert(name, PendingImportObject::existing(found.clone()));
                }
                None => missing.push(name),
            }
        }

        if !missing.is_empty() {
            let records = search_all(
                store,
                &ctx.program,
                EntityType::Germplasm,
                &SearchFilter::by_names(missing),
            )
            .await?;
            for record in records {
                if let Some(found) = record.into_germplasm() {
                    ctx.germplasm
                        .insert(found.natural_key(), PendingImportObject::existing(found));
                }
            }
        }

        debug!(
            program = %ctx.program,
            existing = ctx.germplasm.len(),
            "Existing germplasm staged"
        );
        Ok(())
    }

    fn map_rows(&self, ctx: &mut ImportContext) -> ImportResult<()> {
        let rows = std::mem::take(&mut ctx.rows);
        for (index, row) in rows.iter().enumerate() {
            let Some(name) = row.cell(columns::GERMPLASM_NAME) else {
                continue;
            };
            let key = name.to_string();

            if !ctx.germplasm.contains_key(&key) {
                if let Some(fields) =
                    extract_fields(row, EntityType::Germplasm, SCHEMA, &mut ctx.row_errors)
                {
                    let object = Germplasm {
                        name: key.clone(),
                        accession_number: fields
                            .get(columns::ACCESSION_NUMBER)
                            .map(|v| v.to_string()),
                        female_parent: fields.get(columns::FEMALE_PARENT).map(|v| v.to_string()),
                        male_parent: fields.get(columns::MALE_PARENT).map(|v| v.to_string()),
                        breeding_method: fields
                            .get(columns::BREEDING_METHOD)
                            .map(|v| v.to_string()),
                        db_id: None,
                    };
                    ctx.germplasm
                        .insert(key.clone(), PendingImportObject::new_object(object));
                }
            }
            ctx.row_links[index].germplasm = Some(key);
        }
        ctx.rows = rows;
        Ok(())
    }

    fn validate_dependencies(&self, ctx: &mut ImportContext) {
        let rows = std::mem::take(&mut ctx.rows);
        for (index, row) in rows.iter().enumerate() {
            for column in [columns::FEMALE_PARENT, columns::MALE_PARENT] {
                if let Some(parent) = row.cell(column) {
                    if !ctx.germplasm.contains_key(parent) {
                        ctx.add_row_error(
                            index,
                            EntityType::Germplasm,
                            Some(column),
                            format!("Parent germplasm '{}' is not in this upload or the program", parent),
                        );
                    }
                }
            }
        }
        ctx.rows = rows;
    }

    async fn post_data(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()> {
        let new_germplasm: Vec<(String, Germplasm)> = ctx
            .germplasm
            .iter()
            .filter(|(_, pending)| pending.is_new())
            .map(|(key, pending)| (key.clone(), pending.object.clone()))
            .collect();
        if new_germplasm.is_empty() {
            return Ok(());
        }

        let mut satisfied: HashSet<String> = ctx
            .germplasm
            .iter()
            .filter(|(_, pending)| !pending.is_new())
            .map(|(key, _)| key.clone())
            .collect();
        satisfied.extend(ctx.snapshot.germplasm.keys().cloned());

        let layers = match order_germplasm(&new_germplasm, &satisfied) {
            PedigreeOrder::Layers(layers) => layers,
            PedigreeOrder::Cycle(names) => {
                // Zero creates for germplasm; sibling entity types proceed
                warn!(
                    program = %ctx.program,
                    blocked = names.len(),
                    "Pedigree cycle detected, skipping all germplasm creates"
                );
                ctx.entity_errors
                    .push(crate::error::ImportError::PedigreeCycle { names });
                return Ok(());
            }
        };

        for layer in layers {
            let records: Vec<EntityRecord> = layer
                .iter()
                .filter_map(|key| ctx.germplasm.get(key))
                .map(|pending| EntityRecord::Germplasm(pending.object.clone()))
                .collect();
            let created = create_in_batches(
                store,
                &ctx.program,
                EntityType::Germplasm,
                records,
                ctx.post_batch_size,
            )
            .await?;

            for (key, record) in layer.iter().zip(created) {
                if let (Some(pending), Some(db_id)) =
                    (ctx.germplasm.get_mut(key), record.db_id())
                {
                    pending.object.db_id = Some(db_id.to_string());
                }
            }
        }
        Ok(())
    }
}
