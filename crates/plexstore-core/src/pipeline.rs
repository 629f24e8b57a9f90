//! End-to-end conversion of one solution into a store.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use snafu::prelude::*;
use tracing::{info, warn};

use crate::entity_index::{EntityIndex, EntityIndexError};
use crate::materialize::{
    ArrayMaterializer, MaterializeError, Materialized, PayloadSource, ResolutionReport,
};
use crate::schema::{IngestError, ModelMeta, SchemaIngestor};
use crate::storage::{StagingDir, StorageError};
use crate::store::{
    DEFAULT_COMPRESSION_LEVEL, FormatVersion, StoreAttributes, StoreError, StoreWriter, layout,
};
use crate::time_index::{TimeIndex, TimeIndexError};

/// Errors that abort a conversion. No store is left at the output path.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConvertError {
    /// The staging directory could not be prepared.
    #[snafu(display("Cannot stage store for {}: {source}", output.display()))]
    Staging {
        /// Requested output path.
        output: PathBuf,
        /// Underlying error.
        source: StorageError,
    },

    /// The metadata could not be ingested.
    #[snafu(display("Failed to ingest metadata: {source}"))]
    Ingest {
        /// Underlying error.
        source: IngestError,
    },

    /// Entity coordinates could not be assigned.
    #[snafu(display("Failed to index entities: {source}"))]
    Entities {
        /// Underlying error.
        source: EntityIndexError,
    },

    /// Time axes could not be built.
    #[snafu(display("Failed to build time axes: {source}"))]
    Times {
        /// Underlying error.
        source: TimeIndexError,
    },

    /// A payload could not be decoded.
    #[snafu(display("Failed to decode payloads: {source}"))]
    Materialize {
        /// Underlying error.
        source: MaterializeError,
    },

    /// Two distinct names sanitize to the same store file.
    #[snafu(display(
        "'{first}' and '{second}' would both be stored as {}",
        path.display()
    ))]
    PathCollision {
        /// Store-relative file both names map to.
        path: PathBuf,
        /// Name that claimed the file first.
        first: String,
        /// Colliding name.
        second: String,
    },

    /// The blocking decode task did not complete.
    #[snafu(display("Decode task failed: {source}"))]
    DecodeTask {
        /// Join failure of the task.
        source: tokio::task::JoinError,
    },

    /// Writing the staged store failed.
    #[snafu(display("Failed to write store: {source}"))]
    Write {
        /// Underlying error.
        source: StoreError,
    },

    /// The finished store could not be moved into place.
    #[snafu(display("Failed to publish store to {}: {source}", output.display()))]
    Publish {
        /// Requested output path.
        output: PathBuf,
        /// Underlying error.
        source: StorageError,
    },
}

/// Tunables of one conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertOptions {
    /// zstd level for datasets.
    pub compression_level: i32,
    /// Decode resolutions on the rayon pool instead of one after another.
    pub parallel: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            parallel: true,
        }
    }
}

/// Summary of a finished conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    /// Where the store was published.
    pub output: PathBuf,
    /// Format version written.
    pub format_version: u32,
    /// Metadata records ingested.
    pub records: u64,
    /// Object identity tables written.
    pub object_collections: usize,
    /// Relation identity tables written.
    pub relation_collections: usize,
    /// Datasets written.
    pub datasets: usize,
    /// Values written across all datasets.
    pub values_written: u64,
    /// Bytes of Parquet written.
    pub bytes_written: u64,
    /// One report per decoded payload.
    pub resolutions: Vec<ResolutionReport>,
}

impl ConversionReport {
    /// Keys skipped across all resolutions.
    pub fn skipped_keys(&self) -> usize {
        self.resolutions.iter().map(|r| r.skipped.len()).sum()
    }
}

/// Store files claimed so far, with the name that claimed each.
#[derive(Debug, Default)]
struct ClaimedPaths(BTreeMap<PathBuf, String>);

impl ClaimedPaths {
    fn claim(&mut self, path: PathBuf, name: String) -> Result<(), ConvertError> {
        match self.0.entry(path) {
            Entry::Vacant(slot) => {
                slot.insert(name);
                Ok(())
            }
            Entry::Occupied(slot) => PathCollisionSnafu {
                path: slot.key().clone(),
                first: slot.get().clone(),
                second: name,
            }
            .fail(),
        }
    }
}

/// Everything derived from the metadata and payloads before any write.
struct DecodedSolution {
    meta: ModelMeta,
    entities: EntityIndex,
    times: TimeIndex,
    materialized: Materialized,
}

fn decode_solution(
    metadata: impl Read,
    payloads: &dyn PayloadSource,
    parallel: bool,
) -> Result<DecodedSolution, ConvertError> {
    let schema = SchemaIngestor::ingest(BufReader::new(metadata)).context(IngestSnafu)?;
    let entities = EntityIndex::build(&schema.model).context(EntitiesSnafu)?;
    let times = TimeIndex::build(&schema.model).context(TimesSnafu)?;
    let materialized = ArrayMaterializer::new(&schema.model, &schema.keys, &entities, &times)
        .run(payloads, parallel)
        .context(MaterializeSnafu)?;
    Ok(DecodedSolution {
        meta: schema.model.meta().clone(),
        entities,
        times,
        materialized,
    })
}

/// Convert one solution into a store at `output`.
///
/// `metadata` is the XML description; `payloads` supplies one stream per
/// resolution. Ingestion and decoding run on a blocking thread. The store is
/// assembled in a staging directory next to `output` and replaces it only
/// when every step succeeded.
pub async fn convert_solution<M>(
    metadata: M,
    payloads: Arc<dyn PayloadSource>,
    output: &Path,
    options: &ConvertOptions,
) -> Result<ConversionReport, ConvertError>
where
    M: Read + Send + 'static,
{
    let staging = StagingDir::create(output)
        .await
        .context(StagingSnafu { output })?;
    let writer = StoreWriter::new(staging.location(), options.compression_level)
        .context(WriteSnafu)?;

    let parallel = options.parallel;
    let DecodedSolution {
        meta,
        entities,
        times,
        materialized,
    } = tokio::task::spawn_blocking(move || decode_solution(metadata, payloads.as_ref(), parallel))
        .await
        .context(DecodeTaskSnafu)??;

    let mut claimed = ClaimedPaths::default();
    for (name, _) in entities.object_collections() {
        claimed.claim(layout::object_table_rel_path(name), name.to_string())?;
    }
    for (name, _) in entities.relation_collections() {
        claimed.claim(layout::relation_table_rel_path(name), name.to_string())?;
    }
    for path in materialized.datasets.keys() {
        claimed.claim(layout::dataset_rel_path(path), path.to_string())?;
    }

    let mut bytes_written = 0u64;
    let mut object_collections = 0usize;
    for (name, objects) in entities.object_collections() {
        bytes_written += writer.write_objects(name, objects).await.context(WriteSnafu)?;
        object_collections += 1;
    }
    let mut relation_collections = 0usize;
    for (name, relations) in entities.relation_collections() {
        bytes_written += writer
            .write_relations(name, relations)
            .await
            .context(WriteSnafu)?;
        relation_collections += 1;
    }

    for resolution in times.resolutions() {
        if let Some(axis) = times.axis(resolution) {
            bytes_written += writer
                .write_axis(resolution.as_str(), axis)
                .await
                .context(WriteSnafu)?;
        }
    }
    let mut attrs = StoreAttributes {
        format_version: Some(FormatVersion::CURRENT.tag()),
        producer: layout::PRODUCER.to_string(),
        created_at: chrono::Utc::now().to_rfc3339(),
        namespace: meta.namespace.clone(),
        root_element: meta.root_element.clone(),
        ..Default::default()
    };
    for phase in times.phases() {
        bytes_written += writer
            .write_axis(phase.phase.as_str(), &phase.timestamps)
            .await
            .context(WriteSnafu)?;
        attrs.phases.insert(phase.phase, phase.alignment);
    }

    let datasets = materialized.datasets.len();
    let values_written = materialized.reports.iter().map(|r| r.values_written).sum();
    for (path, dataset) in materialized.datasets {
        bytes_written += writer.write_dataset(&path, dataset).await.context(WriteSnafu)?;
    }
    writer.write_attributes(&attrs).await.context(WriteSnafu)?;

    staging.publish().await.context(PublishSnafu { output })?;

    let report = ConversionReport {
        output: output.to_path_buf(),
        format_version: FormatVersion::CURRENT.tag(),
        records: meta.record_count,
        object_collections,
        relation_collections,
        datasets,
        values_written,
        bytes_written,
        resolutions: materialized.reports,
    };
    if report.skipped_keys() > 0 {
        warn!(skipped = report.skipped_keys(), "some keys were skipped, see the conversion report");
    }
    info!(
        output = %output.display(),
        datasets = report.datasets,
        values = report.values_written,
        bytes = report.bytes_written,
        "store published"
    );
    Ok(report)
}

#[cfg(test)]
mod tests;
