//! Persisted store: identity tables, axes, datasets and attributes.
//!
//! Everything is Parquet except the attributes file. Datasets are written
//! with one row group per entity (`max_row_group_size = timesteps`) and zstd
//! compression, so a query touching a few entities decompresses only their
//! chunks.

pub mod format;
pub mod layout;

use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use bytes::Bytes;
use chrono::NaiveDateTime;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use snafu::{Backtrace, prelude::*};
use tracing::debug;

use crate::common::DatasetPath;
use crate::entity_index::{ObjectIndex, RelationIndex};
use crate::materialize::DenseDataset;
use crate::storage::{self, StorageError, StoreLocation};
use crate::time_index::format_timestamp;

pub use format::{FormatVersion, StoreAttributes};

/// Default zstd level for datasets.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Errors raised while writing or reading store files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// The blocking task encoding a table did not complete.
    #[snafu(display("Encoding task for {path} failed: {source}"))]
    EncodeTask {
        /// Store-relative path of the table.
        path: String,
        /// Join failure of the task.
        source: tokio::task::JoinError,
    },

    /// Filesystem failure.
    #[snafu(display("Store I/O failed: {source}"))]
    StoreIo {
        /// Underlying storage error.
        source: StorageError,
    },

    /// Arrow batch construction failed.
    #[snafu(display("Failed to build batch for {path}: {source}"))]
    Arrow {
        /// Store-relative path of the table.
        path: String,
        /// Underlying Arrow error.
        source: ArrowError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Parquet encoding or decoding failed.
    #[snafu(display("Parquet error at {path}: {source}"))]
    Parquet {
        /// Store-relative path of the table.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The zstd level is out of range.
    #[snafu(display("Invalid zstd compression level {level}: {source}"))]
    InvalidCompressionLevel {
        /// Requested level.
        level: i32,
        /// Validation error.
        source: ParquetError,
    },

    /// The attributes file is not valid JSON for [`StoreAttributes`].
    #[snafu(display("Malformed store attributes: {source}"))]
    Attributes {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The attributes declare a version this build cannot read.
    #[snafu(display("Unsupported store format version {version}"))]
    UnsupportedVersion {
        /// Declared version.
        version: u32,
    },

    /// A table lacks a column or has the wrong column type.
    #[snafu(display("Table {path} has no text column '{column}'"))]
    MissingColumn {
        /// Store-relative path of the table.
        path: String,
        /// Expected column.
        column: String,
    },

    /// An axis holds text that is not a normalized timestamp.
    #[snafu(display("Axis {path} holds invalid timestamp '{value}'"))]
    InvalidAxis {
        /// Store-relative path of the axis.
        path: String,
        /// Offending value.
        value: String,
    },
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Writes store files under one location.
#[derive(Debug, Clone)]
pub struct StoreWriter {
    location: StoreLocation,
    compression: Compression,
}

impl StoreWriter {
    /// Writer for `location` compressing datasets at zstd `compression_level`.
    pub fn new(location: StoreLocation, compression_level: i32) -> StoreResult<Self> {
        let level = ZstdLevel::try_new(compression_level).context(InvalidCompressionLevelSnafu {
            level: compression_level,
        })?;
        Ok(Self {
            location,
            compression: Compression::ZSTD(level),
        })
    }

    /// Root of the store being written.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    fn properties(&self, max_row_group_size: Option<usize>) -> WriterProperties {
        let builder = WriterProperties::builder().set_compression(self.compression);
        match max_row_group_size {
            Some(rows) => builder.set_max_row_group_size(rows.max(1)).build(),
            None => builder.build(),
        }
    }

    async fn write_batch(
        &self,
        rel_path: &Path,
        batch: RecordBatch,
        props: WriterProperties,
    ) -> StoreResult<u64> {
        let path = rel_path.display().to_string();
        let rows = batch.num_rows();
        let task_path = path.clone();
        let buf = tokio::task::spawn_blocking(move || encode_parquet(&task_path, &batch, props))
            .await
            .context(EncodeTaskSnafu { path: path.as_str() })??;
        storage::write_atomic(&self.location, rel_path, &buf)
            .await
            .context(StoreIoSnafu)?;
        debug!(path = %path, bytes = buf.len(), rows, "table written");
        Ok(buf.len() as u64)
    }

    async fn write_text_table(&self, rel_path: &Path, columns: Vec<(&str, Vec<String>)>) -> StoreResult<u64> {
        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, _)| Field::new(*name, DataType::Utf8, false))
            .collect();
        let arrays: Vec<ArrayRef> = columns
            .into_iter()
            .map(|(_, values)| Arc::new(StringArray::from(values)) as ArrayRef)
            .collect();
        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context(ArrowSnafu {
            path: rel_path.display().to_string(),
        })?;
        self.write_batch(rel_path, batch, self.properties(None)).await
    }

    /// Write an object identity table.
    pub async fn write_objects(&self, collection: &str, objects: &ObjectIndex) -> StoreResult<u64> {
        let (names, categories) = objects
            .entries()
            .iter()
            .map(|e| (e.name.clone(), e.category.clone()))
            .unzip();
        self.write_text_table(
            &layout::object_table_rel_path(collection),
            vec![(layout::NAME_COLUMN, names), (layout::CATEGORY_COLUMN, categories)],
        )
        .await
    }

    /// Write a relation identity table.
    pub async fn write_relations(&self, collection: &str, relations: &RelationIndex) -> StoreResult<u64> {
        let (parents, children) = relations
            .entries()
            .iter()
            .map(|e| (e.parent.clone(), e.child.clone()))
            .unzip();
        self.write_text_table(
            &layout::relation_table_rel_path(collection),
            vec![(layout::PARENT_COLUMN, parents), (layout::CHILD_COLUMN, children)],
        )
        .await
    }

    /// Write one time axis under `metadata/times/<axis>`.
    pub async fn write_axis(&self, axis: &str, timestamps: &[NaiveDateTime]) -> StoreResult<u64> {
        let values = timestamps.iter().map(format_timestamp).collect();
        self.write_text_table(
            &layout::axis_rel_path(axis),
            vec![(layout::TIMESTAMP_COLUMN, values)],
        )
        .await
    }

    /// Write one dataset, one row group per entity.
    pub async fn write_dataset(&self, path: &DatasetPath, dataset: DenseDataset) -> StoreResult<u64> {
        let rel_path = layout::dataset_rel_path(path);
        let timesteps = dataset.spec().timesteps;
        let batch = dataset.into_record_batch().context(ArrowSnafu {
            path: rel_path.display().to_string(),
        })?;
        self.write_batch(&rel_path, batch, self.properties(Some(timesteps)))
            .await
    }

    /// Write `_plexstore.json`.
    pub async fn write_attributes(&self, attrs: &StoreAttributes) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(attrs).context(AttributesSnafu)?;
        storage::write_atomic(&self.location, &layout::attrs_rel_path(), &json)
            .await
            .context(StoreIoSnafu)
    }
}

fn encode_parquet(path: &str, batch: &RecordBatch, props: WriterProperties) -> StoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, batch.schema(), Some(props)).context(ParquetSnafu { path })?;
    writer.write(batch).context(ParquetSnafu { path })?;
    writer.close().context(ParquetSnafu { path })?;
    Ok(buf)
}

/// Read `_plexstore.json`, `None` when the store has none.
pub async fn read_attributes(location: &StoreLocation) -> StoreResult<Option<StoreAttributes>> {
    match storage::read_to_string(location, &layout::attrs_rel_path()).await {
        Ok(text) => serde_json::from_str(&text)
            .map(Some)
            .context(AttributesSnafu),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e).context(StoreIoSnafu),
    }
}

/// Detect the format version of a store from its attributes.
pub fn detect_version(attrs: Option<&StoreAttributes>) -> StoreResult<FormatVersion> {
    match attrs.and_then(|a| a.format_version) {
        None => Ok(FormatVersion::V1),
        Some(version) => {
            FormatVersion::from_tag(version).context(UnsupportedVersionSnafu { version })
        }
    }
}

/// A Parquet file loaded into memory, ready for row-group selective reads.
#[derive(Debug, Clone)]
pub struct LoadedTable {
    path: String,
    data: Bytes,
}

impl LoadedTable {
    /// Load the file at `rel_path`. A missing file surfaces as
    /// [`StoreError::StoreIo`] wrapping [`StorageError::NotFound`].
    pub async fn load(location: &StoreLocation, rel_path: &Path) -> StoreResult<Self> {
        let bytes = storage::read_all_bytes(location, rel_path)
            .await
            .context(StoreIoSnafu)?;
        Ok(Self {
            path: rel_path.display().to_string(),
            data: Bytes::from(bytes),
        })
    }

    /// Store-relative path of the file.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn builder(&self) -> StoreResult<ParquetRecordBatchReaderBuilder<Bytes>> {
        ParquetRecordBatchReaderBuilder::try_new(self.data.clone()).context(ParquetSnafu {
            path: self.path.as_str(),
        })
    }

    /// Arrow schema, including its metadata.
    pub fn schema(&self) -> StoreResult<SchemaRef> {
        Ok(self.builder()?.schema().clone())
    }

    /// Row count of each row group, in file order.
    pub fn row_group_rows(&self) -> StoreResult<Vec<usize>> {
        let builder = self.builder()?;
        Ok(builder
            .metadata()
            .row_groups()
            .iter()
            .map(|rg| usize::try_from(rg.num_rows()).unwrap_or(0))
            .collect())
    }

    /// Read the given row groups (all when `None`), in ascending order.
    pub fn read(&self, row_groups: Option<Vec<usize>>) -> StoreResult<Vec<RecordBatch>> {
        let mut builder = self.builder()?;
        if let Some(groups) = row_groups {
            builder = builder.with_row_groups(groups);
        }
        let reader = builder.build().context(ParquetSnafu {
            path: self.path.as_str(),
        })?;
        reader
            .collect::<Result<Vec<_>, ArrowError>>()
            .context(ArrowSnafu {
                path: self.path.as_str(),
            })
    }

    /// Every value of the non-null text columns `columns`, row-aligned.
    pub fn read_text_columns(&self, columns: &[&str]) -> StoreResult<Vec<Vec<String>>> {
        let mut out = vec![Vec::new(); columns.len()];
        for batch in self.read(None)? {
            for (slot, column) in out.iter_mut().zip(columns) {
                let array = batch
                    .column_by_name(column)
                    .and_then(|a| a.as_any().downcast_ref::<StringArray>())
                    .context(MissingColumnSnafu {
                        path: self.path.as_str(),
                        column: *column,
                    })?;
                slot.extend((0..array.len()).map(|i| {
                    if array.is_null(i) {
                        String::new()
                    } else {
                        array.value(i).to_string()
                    }
                }));
            }
        }
        Ok(out)
    }
}

/// Read an axis file back into timestamps.
pub async fn read_axis(location: &StoreLocation, axis: &str) -> StoreResult<Vec<NaiveDateTime>> {
    let table = LoadedTable::load(location, &layout::axis_rel_path(axis)).await?;
    let mut columns = table.read_text_columns(&[layout::TIMESTAMP_COLUMN])?;
    columns
        .pop()
        .unwrap_or_default()
        .into_iter()
        .map(|text| {
            crate::time_index::normalize_timestamp(&text).context(InvalidAxisSnafu {
                path: table.path(),
                value: text.as_str(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Phase, Resolution};
    use crate::entity_index::ObjectEntry;
    use crate::materialize::DatasetSpec;
    use crate::time_index::normalize_timestamp;
    use arrow::array::Float64Array;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn dataset_has_one_row_group_per_entity() -> TestResult {
        let tmp = TempDir::new()?;
        let writer = StoreWriter::new(StoreLocation::local(tmp.path()), DEFAULT_COMPRESSION_LEVEL)?;

        let mut dataset = DenseDataset::new(DatasetSpec {
            entities: 3,
            timesteps: 5,
            bands: 1,
            unit: "MW".into(),
        });
        dataset.write_run(2, 1, &[1.0, 2.0]);
        let path = DatasetPath {
            phase: Phase::ShortTerm,
            resolution: Resolution::Interval,
            collection: "node".into(),
            property: "Price".into(),
        };
        writer.write_dataset(&path, dataset).await?;

        let table = LoadedTable::load(writer.location(), &layout::dataset_rel_path(&path)).await?;
        assert_eq!(table.row_group_rows()?, vec![5, 5, 5]);
        assert_eq!(table.schema()?.metadata()[layout::META_UNIT], "MW");

        let batches = table.read(Some(vec![2]))?;
        let band = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or("band column is not f64")?;
        assert_eq!(band.len(), 5);
        assert_eq!(band.value(1), 2.0);
        assert!(band.is_null(2));
        Ok(())
    }

    #[tokio::test]
    async fn identity_tables_and_axes_round_trip() -> TestResult {
        let tmp = TempDir::new()?;
        let writer = StoreWriter::new(StoreLocation::local(tmp.path()), 1)?;

        let objects = ObjectIndex::from_entries(
            "generator",
            vec![ObjectEntry {
                name: "G1".into(),
                category: String::new(),
            }],
        )?;
        writer.write_objects("generator", &objects).await?;
        let table =
            LoadedTable::load(writer.location(), &layout::object_table_rel_path("generator")).await?;
        let columns = table.read_text_columns(&[layout::NAME_COLUMN, layout::CATEGORY_COLUMN])?;
        assert_eq!(columns, vec![vec!["G1".to_string()], vec![String::new()]]);

        let axis = vec![
            normalize_timestamp("2024-01-01T00:00:00").ok_or("bad timestamp")?,
            normalize_timestamp("2024-01-01T01:00:00").ok_or("bad timestamp")?,
        ];
        writer.write_axis("interval", &axis).await?;
        assert_eq!(read_axis(writer.location(), "interval").await?, axis);
        Ok(())
    }

    #[tokio::test]
    async fn missing_attributes_mean_oldest_version() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let attrs = read_attributes(&location).await?;
        assert!(attrs.is_none());
        assert_eq!(detect_version(attrs.as_ref())?, FormatVersion::V1);

        let future = StoreAttributes {
            format_version: Some(99),
            ..Default::default()
        };
        assert!(matches!(
            detect_version(Some(&future)),
            Err(StoreError::UnsupportedVersion { version: 99 })
        ));
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_compression_level() {
        let err = StoreWriter::new(StoreLocation::local("unused"), 99).expect_err("level 99");
        assert!(matches!(err, StoreError::InvalidCompressionLevel { level: 99, .. }));
    }
}
