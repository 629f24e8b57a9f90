//! Payload decoding into dense datasets.
//!
//! Each resolution has one payload: the concatenated little-endian `f64`
//! runs of its keys, in `key_index` table order. A resolution is decoded
//! strictly sequentially; distinct resolutions may decode in parallel and
//! meet only in the [`DatasetRegistry`].
//!
//! Keys that cannot be placed are skipped and reported. Their runs are still
//! consumed, so the cursor never loses its place.

mod cursor;
mod dataset;
mod payload;

pub use cursor::RunCursor;
pub use dataset::{DatasetRegistry, DatasetSpec, DenseDataset};
pub use payload::{MemoryPayloads, PayloadReader, PayloadSource};

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};

use rayon::prelude::*;
use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, error, info, warn};

use crate::common::{DatasetPath, Resolution};
use crate::entity_index::EntityIndex;
use crate::key_resolver::{KeyResolver, ResolveError};
use crate::schema::{ModelError, RelationalModel};
use crate::time_index::TimeIndex;

/// Errors that abort the decode of one resolution.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MaterializeError {
    /// The `key_index` listing of the resolution is unusable.
    #[snafu(display("Cannot list {resolution} runs: {source}"))]
    Listing {
        /// Resolution being listed.
        resolution: Resolution,
        /// Underlying model error.
        source: ModelError,
    },

    /// A listed run has a negative length.
    #[snafu(display("Key {key_id} declares invalid {resolution} length {length}"))]
    InvalidLength {
        /// Resolution being decoded.
        resolution: Resolution,
        /// Offending key.
        key_id: i64,
        /// Declared length.
        length: i64,
    },

    /// The payload stream failed or ended inside a run.
    #[snafu(display("Failed reading {resolution} payload at key {key_id}: {source}"))]
    PayloadRead {
        /// Resolution being decoded.
        resolution: Resolution,
        /// Key whose run was being read.
        key_id: i64,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The payload source has nothing for the resolution.
    #[snafu(display("No payload for resolution {resolution}"))]
    MissingPayload {
        /// Requested resolution.
        resolution: Resolution,
    },

    /// The payload source could not open the stream.
    #[snafu(display("Cannot open {resolution} payload: {source}"))]
    OpenPayload {
        /// Requested resolution.
        resolution: Resolution,
        /// Source-specific failure.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result alias for materialization.
pub type MaterializeResult<T> = Result<T, MaterializeError>;

/// Why one key's run was not written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// No destination for the key.
    Unresolved,
    /// More than one destination for the key.
    Ambiguous,
    /// The destination entity is not in the identity table.
    UnknownEntity {
        /// Collection identifier.
        collection: String,
        /// Parent object name.
        parent: String,
        /// Child object name.
        child: String,
    },
    /// The run has more values than the axis has timesteps.
    RunTooLong {
        /// Declared run length.
        length: usize,
        /// Axis length.
        timesteps: usize,
    },
    /// The band lies outside the dataset.
    BandOutOfRange {
        /// Band of the key.
        band: usize,
        /// Bands of the dataset.
        bands: usize,
    },
}

impl From<ResolveError> for SkipReason {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unresolved { .. } => SkipReason::Unresolved,
            ResolveError::Ambiguous { .. } => SkipReason::Ambiguous,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unresolved => f.write_str("no destination"),
            SkipReason::Ambiguous => f.write_str("ambiguous destination"),
            SkipReason::UnknownEntity {
                collection,
                parent,
                child,
            } => write!(f, "entity {parent}/{child} not in collection {collection}"),
            SkipReason::RunTooLong { length, timesteps } => {
                write!(f, "run of {length} values exceeds {timesteps} timesteps")
            }
            SkipReason::BandOutOfRange { band, bands } => {
                write!(f, "band {band} outside 1..={bands}")
            }
        }
    }
}

/// One skipped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedKey {
    /// Key id.
    pub key_id: i64,
    /// Why it was skipped.
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// How a resolution was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// The payload was decoded.
    Materialized,
    /// The resolution has no supported layout; payload left unread.
    Unsupported,
    /// The resolution has no time axis; payload left unread.
    NoAxis,
}

/// Outcome of one resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionReport {
    /// Resolution decoded.
    pub resolution: Resolution,
    /// How it was handled.
    pub status: ResolutionStatus,
    /// Runs listed for the resolution.
    pub runs_listed: usize,
    /// Runs written to a dataset.
    pub runs_written: usize,
    /// Values written to datasets.
    pub values_written: u64,
    /// Bytes consumed from the payload.
    pub bytes_read: u64,
    /// Keys skipped, in listing order.
    pub skipped: Vec<SkippedKey>,
}

impl ResolutionReport {
    fn new(resolution: Resolution, status: ResolutionStatus) -> Self {
        Self {
            resolution,
            status,
            runs_listed: 0,
            runs_written: 0,
            values_written: 0,
            bytes_read: 0,
            skipped: Vec::new(),
        }
    }
}

/// Datasets and reports of a complete decode.
#[derive(Debug)]
pub struct Materialized {
    /// Datasets in path order.
    pub datasets: BTreeMap<DatasetPath, DenseDataset>,
    /// One report per resolution, in resolution order.
    pub reports: Vec<ResolutionReport>,
}

/// Decodes payloads into datasets using the precomputed coordinates.
pub struct ArrayMaterializer<'a> {
    model: &'a RelationalModel,
    keys: &'a KeyResolver,
    entities: &'a EntityIndex,
    times: &'a TimeIndex,
    registry: DatasetRegistry,
}

impl<'a> ArrayMaterializer<'a> {
    /// Bind the coordinate tables of one solution.
    pub fn new(
        model: &'a RelationalModel,
        keys: &'a KeyResolver,
        entities: &'a EntityIndex,
        times: &'a TimeIndex,
    ) -> Self {
        Self {
            model,
            keys,
            entities,
            times,
            registry: DatasetRegistry::new(),
        }
    }

    /// (key id, length) pairs of a resolution, in `key_index` order.
    pub fn listing(&self, resolution: Resolution) -> MaterializeResult<Vec<(i64, usize)>> {
        let Some(key_index) = self.model.table("key_index") else {
            return Ok(Vec::new());
        };
        let mut listing = Vec::new();
        for row in key_index.rows() {
            let code = row.require_int("period_type_id").context(ListingSnafu { resolution })?;
            if code != resolution.code() {
                continue;
            }
            let key_id = row.require_int("key_id").context(ListingSnafu { resolution })?;
            let length = row.require_int_text("length").context(ListingSnafu { resolution })?;
            let length = usize::try_from(length).ok().context(InvalidLengthSnafu {
                resolution,
                key_id,
                length,
            })?;
            listing.push((key_id, length));
        }
        Ok(listing)
    }

    /// Decode every payload of `payloads`.
    ///
    /// All resolutions run to completion; the first failure, if any, is
    /// returned afterwards.
    pub fn run(self, payloads: &dyn PayloadSource, parallel: bool) -> MaterializeResult<Materialized> {
        let resolutions = payloads.resolutions();
        let results: Vec<MaterializeResult<ResolutionReport>> = if parallel {
            resolutions
                .par_iter()
                .map(|res| self.materialize_resolution(*res, payloads))
                .collect()
        } else {
            resolutions
                .iter()
                .map(|res| self.materialize_resolution(*res, payloads))
                .collect()
        };

        let mut reports = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(error = %e, "resolution aborted");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        reports.sort_by_key(|r| r.resolution);
        Ok(Materialized {
            datasets: self.registry.into_datasets(),
            reports,
        })
    }

    fn materialize_resolution(
        &self,
        resolution: Resolution,
        payloads: &dyn PayloadSource,
    ) -> MaterializeResult<ResolutionReport> {
        if self.times.is_unsupported(resolution) {
            warn!(%resolution, "resolution unsupported, payload skipped");
            return self.unread_report(resolution, ResolutionStatus::Unsupported);
        }
        let timesteps = self.times.timesteps(resolution).unwrap_or(0);
        if timesteps == 0 {
            warn!(%resolution, "resolution has no time axis, payload skipped");
            return self.unread_report(resolution, ResolutionStatus::NoAxis);
        }

        let listing = self.listing(resolution)?;
        info!(%resolution, runs = listing.len(), timesteps, "decoding payload");
        payloads.with_payload(resolution, &mut |reader: &mut dyn Read| {
            self.decode(resolution, timesteps, &listing, reader)
        })
    }

    fn unread_report(
        &self,
        resolution: Resolution,
        status: ResolutionStatus,
    ) -> MaterializeResult<ResolutionReport> {
        let listing = self.listing(resolution)?;
        let mut report = ResolutionReport::new(resolution, status);
        report.runs_listed = listing.len();
        Ok(report)
    }

    fn decode(
        &self,
        resolution: Resolution,
        timesteps: usize,
        listing: &[(i64, usize)],
        reader: &mut dyn Read,
    ) -> MaterializeResult<ResolutionReport> {
        let mut report = ResolutionReport::new(resolution, ResolutionStatus::Materialized);
        report.runs_listed = listing.len();
        let mut cursor = RunCursor::new(reader);
        let mut run = Vec::new();

        for &(key_id, length) in listing {
            cursor
                .read_run(length, &mut run)
                .context(PayloadReadSnafu { resolution, key_id })?;
            match self.place(resolution, key_id, timesteps, &run) {
                Ok(()) => {
                    report.runs_written += 1;
                    report.values_written += run.len() as u64;
                }
                Err(reason) => {
                    warn!(%resolution, key_id, %reason, "key skipped");
                    report.skipped.push(SkippedKey { key_id, reason });
                }
            }
        }

        report.bytes_read = cursor.consumed();
        info!(
            %resolution,
            written = report.runs_written,
            skipped = report.skipped.len(),
            "payload decoded"
        );
        Ok(report)
    }

    fn place(
        &self,
        resolution: Resolution,
        key_id: i64,
        timesteps: usize,
        run: &[f64],
    ) -> Result<(), SkipReason> {
        let dest = self.keys.resolve(resolution, key_id)?;
        let coordinate = self
            .entities
            .entity_count(&dest.collection)
            .zip(
                self.entities
                    .coordinate(&dest.collection, &dest.parent_name, &dest.child_name),
            );
        let Some((entities, entity)) = coordinate else {
            return Err(SkipReason::UnknownEntity {
                collection: dest.collection.name.clone(),
                parent: dest.parent_name.clone(),
                child: dest.child_name.clone(),
            });
        };
        if run.len() > timesteps {
            return Err(SkipReason::RunTooLong {
                length: run.len(),
                timesteps,
            });
        }

        let path = DatasetPath {
            phase: dest.phase,
            resolution,
            collection: dest.collection.name.clone(),
            property: dest.property.clone(),
        };
        let dataset = self.registry.get_or_create(&path, || {
            debug!(%path, entities, timesteps, bands = dest.band_count, "dataset created");
            DatasetSpec {
                entities,
                timesteps,
                bands: dest.band_count,
                unit: dest.reported_unit().to_string(),
            }
        });

        let mut dataset = dataset.lock();
        if dataset.write_run(entity, dest.band, run) {
            Ok(())
        } else {
            Err(SkipReason::BandOutOfRange {
                band: dest.band,
                bands: dataset.spec().bands,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Phase;
    use crate::schema::SchemaIngestor;
    use crate::test_util::SolutionFixture;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    struct Solution {
        schema: crate::schema::IngestedSchema,
        entities: EntityIndex,
        times: TimeIndex,
    }

    fn prepare(fixture: &SolutionFixture) -> Result<Solution, Box<dyn std::error::Error>> {
        let schema = SchemaIngestor::ingest(fixture.metadata_xml().as_bytes())?;
        let entities = EntityIndex::build(&schema.model)?;
        let times = TimeIndex::build(&schema.model)?;
        Ok(Solution {
            schema,
            entities,
            times,
        })
    }

    fn decode(fixture: &SolutionFixture, parallel: bool) -> Result<Materialized, Box<dyn std::error::Error>> {
        let solution = prepare(fixture)?;
        let materializer = ArrayMaterializer::new(
            &solution.schema.model,
            &solution.schema.keys,
            &solution.entities,
            &solution.times,
        );
        Ok(materializer.run(&fixture.payloads(), parallel)?)
    }

    fn line_flow() -> DatasetPath {
        DatasetPath {
            phase: Phase::ShortTerm,
            resolution: Resolution::Interval,
            collection: "line".into(),
            property: "Flow".into(),
        }
    }

    #[test]
    fn decoded_run_reads_back_bit_exact_with_missing_tail() -> TestResult {
        let out = decode(&SolutionFixture::sample(), false)?;
        let flow = &out.datasets[&line_flow()];
        let t = flow.spec().timesteps;
        assert_eq!(t, SolutionFixture::INTERVALS);

        for (i, expected) in SolutionFixture::LINE_FLOW.iter().enumerate() {
            let got = flow.get(0, i, 1).expect("value present");
            assert_eq!(got.to_bits(), expected.to_bits());
        }
        for i in SolutionFixture::LINE_FLOW.len()..t {
            assert_eq!(flow.get(0, i, 1), None);
        }
        assert_eq!(flow.spec().unit, "MW");
        Ok(())
    }

    #[test]
    fn skipped_keys_do_not_desynchronize_the_cursor() -> TestResult {
        let out = decode(&SolutionFixture::sample(), true)?;
        let interval = out
            .reports
            .iter()
            .find(|r| r.resolution == Resolution::Interval)
            .expect("interval report");

        let skipped: Vec<_> = interval.skipped.iter().map(|s| s.key_id).collect();
        assert_eq!(
            skipped,
            vec![SolutionFixture::KEY_ORPHAN, SolutionFixture::KEY_LONG_FLOW]
        );
        assert!(matches!(
            interval.skipped[1].reason,
            SkipReason::RunTooLong { length: 50, .. }
        ));

        // Key listed after the skipped runs still lands on its own values.
        let generation = &out.datasets[&DatasetPath {
            phase: Phase::ShortTerm,
            resolution: Resolution::Interval,
            collection: "generator".into(),
            property: "Generation".into(),
        }];
        let expected = SolutionFixture::cc_generation();
        assert_eq!(generation.get(1, 47, 1), Some(expected[47]));
        Ok(())
    }

    #[test]
    fn unsupported_resolution_is_reported_unread() -> TestResult {
        let out = decode(&SolutionFixture::sample(), true)?;
        let week = out
            .reports
            .iter()
            .find(|r| r.resolution == Resolution::Week)
            .expect("week report");
        assert_eq!(week.status, ResolutionStatus::Unsupported);
        assert_eq!(week.bytes_read, 0);
        assert!(out.datasets.keys().all(|p| p.resolution != Resolution::Week));
        Ok(())
    }

    #[test]
    fn relation_bands_share_one_dataset() -> TestResult {
        let out = decode(&SolutionFixture::sample(), true)?;
        let offtake = &out.datasets[&DatasetPath {
            phase: Phase::ShortTerm,
            resolution: Resolution::Interval,
            collection: "generator_fuels".into(),
            property: "Offtake".into(),
        }];
        assert_eq!(offtake.spec().bands, 2);
        assert_eq!(offtake.spec().unit, "GJ");
        // 101_CT_1 -> Coal is entity 0 and writes band 2 only.
        assert_eq!(offtake.get(0, 0, 1), None);
        assert!(offtake.get(0, 0, 2).is_some());
        assert!(offtake.get(1, 0, 1).is_some());
        Ok(())
    }

    #[test]
    fn short_payload_fails_the_resolution() -> TestResult {
        let fixture = SolutionFixture::sample();
        let solution = prepare(&fixture)?;
        let mut payloads = fixture.payloads();
        let interval = payloads
            .get(Resolution::Interval)
            .map(|b| b[..b.len() - 8].to_vec())
            .unwrap_or_default();
        payloads.insert(Resolution::Interval, interval);

        let materializer = ArrayMaterializer::new(
            &solution.schema.model,
            &solution.schema.keys,
            &solution.entities,
            &solution.times,
        );
        let err = materializer
            .run(&payloads, true)
            .expect_err("truncated payload must fail");
        assert!(matches!(
            err,
            MaterializeError::PayloadRead {
                resolution: Resolution::Interval,
                ..
            }
        ));
        Ok(())
    }
}
