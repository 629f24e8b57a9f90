//! Core engine for converting simulation solution archives into a
//! queryable array store.
//!
//! The conversion runs in three stages:
//!
//! - Schema ingestion (`schema` module): the XML metadata description is
//!   streamed once and turned into a relational model whose tables, columns
//!   and keys are inferred from field names rather than declared up front.
//! - Coordinate resolution (`entity_index`, `time_index`, `key_resolver`):
//!   dense entity coordinates, one timestamp axis per resolution and per phase,
//!   and a precomputed key → dataset descriptor table.
//! - Materialization (`materialize`, `store`): raw little-endian `f64` runs are
//!   decoded through a forward-only cursor and written into chunked, compressed
//!   Parquet-backed datasets addressed by phase/resolution/collection/property.
//!
//! `pipeline::convert_solution` wires the stages together with
//! write-then-publish semantics, and `query::SolutionStore` opens a finished
//! store read-only and answers labeled, filtered reads.
#![deny(missing_docs)]
pub mod common;
pub mod entity_index;
pub mod key_resolver;
pub mod materialize;
pub mod pipeline;
pub mod query;
pub mod schema;
pub mod storage;
pub mod store;
pub mod time_index;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use common::{CollectionId, CollectionKind, DatasetPath, Phase, Resolution};
pub use pipeline::{ConvertError, ConvertOptions, ConversionReport, convert_solution};
pub use query::{
    EntityFilter, EntityLabel, LabeledSeries, NameFilter, QueryError, SeriesPoint, SolutionStore,
};
pub use storage::{StorageError, StoreLocation};
