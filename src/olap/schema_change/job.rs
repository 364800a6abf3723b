// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Array, new_null_array};
use tracing::{info, warn};

use crate::common::ids::TabletId;
use crate::common::status::{Status, StatusResult};
use crate::olap::block::parse_default_literal_to_singleton_array;
use crate::olap::block_changer::{BlockChanger, schema_change_allowed};
use crate::olap::column_mapping::ColumnMapping;
use crate::olap::delete_bitmap::calc_delete_bitmap;
use crate::olap::delete_handler::DeleteHandler;
use crate::olap::expr::DescriptorTbl;
use crate::olap::olap_common::{AlterTabletType, KeysType, TabletState, Version};
use crate::olap::rowset::{PendingRowsetGuard, RowsetSharedPtr, RowsetWriterContext};
use crate::olap::schema_change::params::{
    AlterTabletRequest, SHADOW_COLUMN_PREFIX, SchemaChangeParams, WHERE_SIGN,
};
use crate::olap::schema_change::{
    LinkedSchemaChange, LocalSchemaChangeWithSorting, SchemaChange, SchemaChangeDirectly,
};
use crate::olap::storage_engine::{StorageEngine, StorageEnv};
use crate::olap::tablet::{DeleteBitmapSnapshot, TabletSharedPtr, max_continuous_version_of};
use crate::olap::tablet_schema::{TabletColumn, TabletSchema};

/// Conversion strategy chosen by [`SchemaChangeJob::parse_request`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchemaChangeKind {
    /// Storage layouts match; base segments are reused.
    Linked,
    /// Rows are rewritten in their original order.
    Directly,
    /// Rows are rewritten and re-sorted by the new key columns.
    Sorting,
}

/// Converted rowsets waiting for publish, protected from garbage collection.
#[derive(Default)]
struct StagedRowsets {
    rowsets: Vec<RowsetSharedPtr>,
    pending_guards: Vec<PendingRowsetGuard>,
}

/// One alter task turning the data of a base tablet into a new tablet.
///
/// The new tablet must exist in `NotReady` state. On success every historical
/// version up to the request's alter version is readable from the new tablet
/// and its state is `Running`; on failure the new tablet is left without any
/// converted rowset and the base tablet is never modified.
pub struct SchemaChangeJob {
    engine: Arc<StorageEngine>,
    base_tablet: Option<TabletSharedPtr>,
    new_tablet: Option<TabletSharedPtr>,
    job_id: String,
}

impl SchemaChangeJob {
    pub fn new(
        engine: Arc<StorageEngine>,
        request: &AlterTabletRequest,
        job_id: impl Into<String>,
    ) -> Self {
        let base_tablet = engine.get_tablet(request.base_tablet_id);
        let new_tablet = engine.get_tablet(request.new_tablet_id);
        Self {
            engine,
            base_tablet,
            new_tablet,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn tablet_in_converting(&self, tablet_id: TabletId) -> bool {
        self.engine.tablet_in_converting(tablet_id)
    }

    pub fn process_alter_tablet(&self, request: &AlterTabletRequest) -> StatusResult<()> {
        let desc_tbl = request.desc_tbl.as_ref().ok_or_else(|| {
            Status::Internal(
                "desc_tbl is not set. Maybe the FE version is not equal to the BE version"
                    .to_string(),
            )
        })?;
        let base_tablet = self.base_tablet.as_ref().ok_or_else(|| {
            Status::NotFound(format!(
                "fail to find base tablet. base_tablet={}",
                request.base_tablet_id
            ))
        })?;
        let new_tablet = self.new_tablet.as_ref().ok_or_else(|| {
            Status::NotFound(format!(
                "fail to find new tablet. new_tablet={}",
                request.new_tablet_id
            ))
        })?;

        info!(
            job_id = %self.job_id,
            base_tablet_id = base_tablet.tablet_id(),
            new_tablet_id = new_tablet.tablet_id(),
            alter_version = request.alter_version,
            alter_tablet_type = %request.alter_tablet_type,
            "begin to do request alter tablet"
        );

        let _converting = self.engine.try_add_converting(new_tablet.tablet_id())?;
        let res = self.do_process_alter_tablet(request, desc_tbl, base_tablet, new_tablet);
        match &res {
            Ok(()) => info!(
                job_id = %self.job_id,
                new_tablet_id = new_tablet.tablet_id(),
                "finished alter tablet process"
            ),
            Err(e) => warn!(
                job_id = %self.job_id,
                base_tablet_id = base_tablet.tablet_id(),
                new_tablet_id = new_tablet.tablet_id(),
                error = %e,
                "failed to alter tablet"
            ),
        }
        res
    }

    fn do_process_alter_tablet(
        &self,
        request: &AlterTabletRequest,
        desc_tbl: &DescriptorTbl,
        base_tablet: &TabletSharedPtr,
        new_tablet: &TabletSharedPtr,
    ) -> StatusResult<()> {
        if new_tablet.tablet_state() != TabletState::NotReady {
            let res = self.validate_alter_result(request, new_tablet, &new_tablet.rowsets());
            info!(
                new_tablet_id = new_tablet.tablet_id(),
                tablet_state = ?new_tablet.tablet_state(),
                ok = res.is_ok(),
                "the convert job already finished, check its version"
            );
            return res;
        }

        let (versions_to_be_changed, max_rowset) = self.get_versions_to_be_changed(base_tablet)?;
        if max_rowset.end_version() < request.alter_version {
            return Err(Status::Internal(format!(
                "base tablet's max version={} is less than request version={}",
                max_rowset.end_version(),
                request.alter_version
            )));
        }

        info!(
            new_tablet_id = new_tablet.tablet_id(),
            end_version = max_rowset.end_version(),
            "begin to remove all data before end version from new tablet to prevent rewrite"
        );
        for rowset in new_tablet.remove_rowsets_up_to(max_rowset.end_version()) {
            self.engine.add_unused_rowset(rowset);
        }

        let end_version = versions_to_be_changed
            .iter()
            .map(|v| v.end)
            .max()
            .unwrap_or(-1);
        let rowsets = base_tablet.capture_rowsets(&versions_to_be_changed)?;
        if rowsets.is_empty() {
            return Err(Status::NotFound(format!(
                "fail to acquire all data sources. version_num={}, data_source_num=0",
                versions_to_be_changed.len()
            )));
        }
        let delete_handler = Arc::new(DeleteHandler::init(
            base_tablet.tablet_schema(),
            &base_tablet.delete_predicates(),
            end_version,
        )?);

        let batch_size = self.engine.options().batch_size;
        let mut sc_params = SchemaChangeParams::new(request.alter_tablet_type, desc_tbl.clone());
        for rowset in rowsets {
            sc_params.ref_rowset_readers.push(
                self.engine.rowset_factory().create_rowset_reader(
                    rowset,
                    Some(Arc::clone(&delete_handler)),
                    batch_size,
                )?,
            );
        }
        sc_params.delete_handler = delete_handler;
        sc_params.be_exec_version = request
            .be_exec_version
            .unwrap_or(self.engine.options().be_exec_version);
        for param in &request.materialized_view_params {
            sc_params.add_materialized_param(param.clone());
        }
        sc_params.enable_unique_key_merge_on_write = new_tablet.enable_unique_key_merge_on_write();

        let mut staged = StagedRowsets::default();
        let res = self
            .convert_historical_rowsets(&mut sc_params, base_tablet, new_tablet, &mut staged)
            .and_then(|real_alter_version| {
                self.finish_alter(request, new_tablet, &staged, real_alter_version)
            });
        let delete_bitmap = match res {
            Ok(delete_bitmap) => delete_bitmap,
            Err(e) => {
                self.discard_staged(staged);
                return Err(e);
            }
        };

        let StagedRowsets {
            rowsets,
            pending_guards,
        } = staged;
        let skipped = new_tablet.publish_alter(rowsets, delete_bitmap)?;
        for rowset in skipped {
            warn!(
                new_tablet_id = new_tablet.tablet_id(),
                version = %rowset.version(),
                "version already exist, version revert occurred"
            );
            self.engine.add_unused_rowset(rowset);
        }
        drop(pending_guards);
        Ok(())
    }

    /// Checks run between conversion and publish; returns the bitmap to publish.
    fn finish_alter(
        &self,
        request: &AlterTabletRequest,
        new_tablet: &TabletSharedPtr,
        staged: &StagedRowsets,
        real_alter_version: i64,
    ) -> StatusResult<Option<DeleteBitmapSnapshot>> {
        if real_alter_version < request.alter_version {
            return Err(Status::Internal(format!(
                "real alter version={} is less than request version={}",
                real_alter_version, request.alter_version
            )));
        }
        let delete_bitmap = if new_tablet.keys_type() == KeysType::UniqueKeys
            && new_tablet.enable_unique_key_merge_on_write()
        {
            Some(self.calc_delete_bitmap_for_mow_table(
                new_tablet,
                &staged.rowsets,
                real_alter_version,
            )?)
        } else {
            None
        };
        let candidate = rowsets_after_publish(new_tablet, &staged.rowsets);
        self.validate_alter_result(request, new_tablet, &candidate)?;
        Ok(delete_bitmap)
    }

    fn discard_staged(&self, staged: StagedRowsets) {
        for rowset in staged.rowsets {
            self.engine.add_unused_rowset(rowset);
        }
    }

    /// Historical versions of the base tablet, anchored at its max rowset.
    fn get_versions_to_be_changed(
        &self,
        base_tablet: &TabletSharedPtr,
    ) -> StatusResult<(Vec<Version>, RowsetSharedPtr)> {
        let max_rowset = base_tablet.get_rowset_with_max_version().ok_or_else(|| {
            Status::NotFound(format!(
                "Tablet has no version. base_tablet={}",
                base_tablet.tablet_id()
            ))
        })?;
        let versions =
            base_tablet.capture_consistent_versions(Version::new(0, max_rowset.end_version()))?;
        Ok((versions, max_rowset))
    }

    /// Convert every source rowset and stage the results. Returns the end version reached.
    fn convert_historical_rowsets(
        &self,
        sc_params: &mut SchemaChangeParams,
        base_tablet: &TabletSharedPtr,
        new_tablet: &TabletSharedPtr,
        staged: &mut StagedRowsets,
    ) -> StatusResult<i64> {
        info!(
            base_tablet_id = base_tablet.tablet_id(),
            new_tablet_id = new_tablet.tablet_id(),
            "begin to convert historical rowsets for new_tablet from base_tablet"
        );
        let end_version = sc_params
            .ref_rowset_readers
            .iter()
            .map(|reader| reader.version().end)
            .max()
            .unwrap_or(-1);

        let new_schema = new_tablet.tablet_schema();
        let mut changer = BlockChanger::new(Arc::clone(new_schema), sc_params.desc_tbl.clone())?;
        let kind = Self::parse_request(
            sc_params,
            base_tablet.tablet_schema(),
            new_schema,
            &mut changer,
        )
        .inspect_err(|e| warn!(error = %e, "failed to parse the request"))?;
        info!(
            sc_kind = ?kind,
            base_tablet_id = base_tablet.tablet_id(),
            new_tablet_id = new_tablet.tablet_id(),
            "schema change type"
        );
        let mut sc_procedure = self.get_sc_procedure(Arc::new(changer), kind)?;
        for reader in sc_params.ref_rowset_readers.iter_mut() {
            let source = Arc::clone(reader.rowset());
            let context = RowsetWriterContext {
                rowset_id: self.engine.next_rowset_id(),
                tablet_id: new_tablet.tablet_id(),
                tablet_schema: Arc::clone(new_schema),
                version: source.version(),
                segments_overlap: source.meta().segments_overlap,
                newest_write_timestamp: source.newest_write_timestamp(),
                delete_predicate: None,
            };
            let mut writer = self
                .engine
                .rowset_factory()
                .create_rowset_writer(context)
                .map_err(|e| e.with_context("create_rowset_writer failed"))?;
            staged
                .pending_guards
                .push(self.engine.add_pending_rowset(writer.rowset_id()));

            sc_procedure
                .process(reader.as_mut(), writer.as_mut(), new_tablet)
                .inspect_err(|e| {
                    warn!(
                        version = %source.version(),
                        error = %e,
                        "failed to process the version"
                    )
                })?;
            let new_rowset = writer
                .build()
                .inspect_err(|e| warn!(error = %e, "failed to build rowset, exit alter process"))?;

            if new_tablet.has_version(new_rowset.version()) {
                warn!(
                    new_tablet_id = new_tablet.tablet_id(),
                    version = %new_rowset.version(),
                    "version already exist, version revert occurred"
                );
                self.engine.add_unused_rowset(new_rowset);
                continue;
            }
            info!(
                new_tablet_id = new_tablet.tablet_id(),
                version = %new_rowset.version(),
                rows = new_rowset.num_rows(),
                "succeed to convert a history version"
            );
            staged.rowsets.push(new_rowset);
        }

        let converted = rowsets_after_publish(new_tablet, &staged.rowsets);
        let reached = max_continuous_version_of(converted.iter().map(|rs| rs.version()));
        if reached < end_version {
            return Err(Status::NotFound(format!(
                "version path of new tablet {} is broken: expect [0-{}], continuous until {}",
                new_tablet.tablet_id(),
                end_version,
                reached
            )));
        }
        info!(
            new_tablet_id = new_tablet.tablet_id(),
            end_version,
            staged = staged.rowsets.len(),
            "finish converting rowsets for new_tablet from base_tablet"
        );
        Ok(end_version)
    }

    /// Plan an alteration: fill the changer's mapping and pick the strategy.
    ///
    /// Touches nothing but `changer`, so it can be used as a dry run.
    pub fn parse_request(
        sc_params: &SchemaChangeParams,
        base_schema: &TabletSchema,
        new_schema: &TabletSchema,
        changer: &mut BlockChanger,
    ) -> StatusResult<SchemaChangeKind> {
        changer.set_type(sc_params.alter_tablet_type);
        changer.set_compatible_version(sc_params.be_exec_version);

        let mut sc_directly = false;
        for (i, new_column) in new_schema.columns().iter().enumerate() {
            let mv_param = sc_params.materialized_param(&new_column.name);
            let ref_column_idx = match mv_param.and_then(|p| p.origin_column_name.as_deref()) {
                Some(origin) => base_schema.field_index(origin),
                None => base_schema.field_index(&new_column.name),
            };

            let mapping = if let Some(expr) = mv_param.and_then(|p| p.mv_expr.as_ref()) {
                ColumnMapping::Expression {
                    expr: Arc::clone(expr),
                }
            } else if let Some(ref_column_idx) = ref_column_idx {
                let from = base_schema.column(ref_column_idx).arrow_type()?;
                let to = new_column.arrow_type()?;
                if !schema_change_allowed(&from, &to) {
                    return Err(Status::NotSupported(format!(
                        "column {} can not be changed from {} to {}",
                        new_column.name,
                        base_schema.column(ref_column_idx).column_type,
                        new_column.column_type
                    )));
                }
                ColumnMapping::Reference { ref_column_idx }
            } else if sc_params.alter_tablet_type == AlterTabletType::Rollup {
                let mut mv_columns = sc_params
                    .materialized_params_map
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>();
                mv_columns.sort();
                return Err(Status::Internal(format!(
                    "referenced column was missing. [column={}, materialized_function_map={:?}]",
                    new_column.name, mv_columns
                )));
            } else if new_column.name.starts_with(SHADOW_COLUMN_PREFIX) {
                info!(column = %new_column.name, "a shadow column is encountered");
                return Err(Status::Internal(
                    "failed due to operate on shadow column".to_string(),
                ));
            } else {
                if i < base_schema.num_short_key_columns() {
                    sc_directly = true;
                }
                let mut mapping = ColumnMapping::Unset;
                Self::init_column_mapping(
                    &mut mapping,
                    new_column,
                    new_column.default_value.as_deref(),
                )?;
                info!(
                    column = %new_column.name,
                    default_value = new_column.default_value.as_deref().unwrap_or("NULL"),
                    "A column with default value will be added after schema changing"
                );
                mapping
            };
            let slot = changer.get_mutable_column_mapping(i).ok_or_else(|| {
                Status::Internal(format!("column mapping {i} is out of range"))
            })?;
            *slot = mapping;
        }

        if let Some(expr) = sc_params
            .materialized_param(WHERE_SIGN)
            .and_then(|p| p.mv_expr.as_ref())
        {
            changer.set_where_expr(Arc::clone(expr));
        }

        if sc_params.alter_tablet_type == AlterTabletType::Rollup {
            return Ok(SchemaChangeKind::Sorting);
        }

        // Key columns must keep their relative order, skipping added constant keys.
        let mut num_default_value = 0;
        for i in 0..new_schema.num_key_columns() {
            match changer.schema_mapping()[i].ref_column_idx() {
                None => num_default_value += 1,
                Some(ref_idx) => {
                    if ref_idx != i - num_default_value || ref_idx >= base_schema.num_key_columns()
                    {
                        return Ok(SchemaChangeKind::Sorting);
                    }
                }
            }
        }
        if base_schema.keys_type() != new_schema.keys_type() {
            return Ok(SchemaChangeKind::Sorting);
        }
        if new_schema.keys_type() != KeysType::DupKeys
            && new_schema.num_key_columns() < base_schema.num_key_columns()
        {
            return Ok(SchemaChangeKind::Sorting);
        }

        if sc_params.enable_unique_key_merge_on_write
            && new_schema.num_key_columns() > base_schema.num_key_columns()
        {
            return Ok(SchemaChangeKind::Directly);
        }
        if base_schema.num_short_key_columns() != new_schema.num_short_key_columns() {
            return Ok(SchemaChangeKind::Directly);
        }
        if sc_directly || !sc_params.delete_handler.is_empty() {
            return Ok(SchemaChangeKind::Directly);
        }
        if base_schema.num_columns() != new_schema.num_columns() {
            return Ok(SchemaChangeKind::Directly);
        }
        for (i, mapping) in changer.schema_mapping().iter().enumerate() {
            let Some(ref_idx) = mapping.ref_column_idx() else {
                return Ok(SchemaChangeKind::Directly);
            };
            let new_column = new_schema.column(i);
            let old_column = base_schema.column(ref_idx);
            if ref_idx != i
                || new_column.normalized_type() != old_column.normalized_type()
                || new_column.is_nullable != old_column.is_nullable
                || new_column.is_key != old_column.is_key
                || new_column.aggregation != old_column.aggregation
            {
                return Ok(SchemaChangeKind::Directly);
            }
        }
        Ok(SchemaChangeKind::Linked)
    }

    fn get_sc_procedure(
        &self,
        changer: Arc<BlockChanger>,
        kind: SchemaChangeKind,
    ) -> StatusResult<Box<dyn SchemaChange>> {
        let options = self.engine.options();
        Ok(match kind {
            SchemaChangeKind::Sorting => {
                let env: Arc<dyn StorageEnv> = self.engine.clone();
                Box::new(LocalSchemaChangeWithSorting::new(
                    changer,
                    env,
                    self.engine.mem_tracker(),
                    options.memory_limitation_bytes,
                    options.sort_max_buffered_rows,
                    options.batch_size,
                )?)
            }
            SchemaChangeKind::Directly => Box::new(SchemaChangeDirectly::new(changer)),
            SchemaChangeKind::Linked => Box::new(LinkedSchemaChange::new(changer)),
        })
    }

    /// Resolve the constant an added column is filled with.
    fn init_column_mapping(
        mapping: &mut ColumnMapping,
        column: &TabletColumn,
        value: Option<&str>,
    ) -> StatusResult<()> {
        let data_type = column.arrow_type()?;
        let value = match value {
            None | Some("") if column.is_nullable => new_null_array(&data_type, 1),
            None => {
                return Err(Status::InvalidArgument(format!(
                    "added column {} is not nullable and has no default value",
                    column.name
                )));
            }
            Some(literal) => parse_default_literal_to_singleton_array(&data_type, literal)?,
        };
        if !column.is_nullable && value.null_count() > 0 {
            return Err(Status::InvalidArgument(format!(
                "added column {} is not nullable but its default value is NULL",
                column.name
            )));
        }
        *mapping = ColumnMapping::DefaultValue { value };
        Ok(())
    }

    fn calc_delete_bitmap_for_mow_table(
        &self,
        new_tablet: &TabletSharedPtr,
        converted: &[RowsetSharedPtr],
        alter_version: i64,
    ) -> StatusResult<DeleteBitmapSnapshot> {
        let rowsets = rowsets_after_publish(new_tablet, converted);
        let delete_bitmap = calc_delete_bitmap(new_tablet.tablet_schema(), &rowsets)?;
        info!(
            new_tablet_id = new_tablet.tablet_id(),
            alter_version,
            rowsets = rowsets.len(),
            deleted_rows = delete_bitmap.cardinality(),
            "calculated delete bitmap for merge-on-write table"
        );
        Ok(DeleteBitmapSnapshot {
            delete_bitmap,
            basis: rowsets.iter().map(|rs| rs.rowset_id()).collect(),
        })
    }

    /// The new tablet must cover every version up to the alter version with intact rowsets.
    fn validate_alter_result(
        &self,
        request: &AlterTabletRequest,
        new_tablet: &TabletSharedPtr,
        rowsets: &[RowsetSharedPtr],
    ) -> StatusResult<()> {
        let max_continuous_version = max_continuous_version_of(rowsets.iter().map(|rs| rs.version()));
        info!(
            new_tablet_id = new_tablet.tablet_id(),
            max_continuous_version,
            alter_version = request.alter_version,
            "find max continuous version of tablet"
        );
        if max_continuous_version < request.alter_version {
            return Err(Status::Internal(format!(
                "result version={} is less than request version={}",
                max_continuous_version, request.alter_version
            )));
        }
        for rowset in rowsets {
            let segment_rows = rowset.segments().iter().map(|s| s.num_rows()).sum::<usize>();
            if segment_rows != rowset.num_rows() {
                return Err(Status::NotFound(format!(
                    "SchemaChangeJob::validate_alter_result meet invalid rowset: rowset_id={} num_rows={} segment_rows={}",
                    rowset.rowset_id(),
                    rowset.num_rows(),
                    segment_rows
                )));
            }
        }
        Ok(())
    }
}

/// Rowsets of `new_tablet` once `staged` is published, in version order.
fn rowsets_after_publish(
    new_tablet: &TabletSharedPtr,
    staged: &[RowsetSharedPtr],
) -> Vec<RowsetSharedPtr> {
    let mut by_version = new_tablet
        .rowsets()
        .into_iter()
        .map(|rs| (rs.version(), rs))
        .collect::<BTreeMap<_, _>>();
    for rowset in staged {
        by_version
            .entry(rowset.version())
            .or_insert_with(|| Arc::clone(rowset));
    }
    by_version.into_values().collect()
}
