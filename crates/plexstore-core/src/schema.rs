//! Schema ingestion: metadata XML to relational model.
//!
//! The metadata description carries no schema. Tables, columns and keys are
//! inferred from field names while the document is streamed once, then a
//! single finalization step fixes the constraints, builds the derived views
//! and indices, and precomputes the key resolver.
//!
//! Naming rules:
//! - a record element `t_<table>` belongs to table `<table>`;
//! - a field `<x>_id` is an integer, anything else is text;
//! - `<table>_id` is the primary key of `<table>` (except [`PK_EXCEPTIONS`]);
//! - any other `<x>_id` becomes a foreign key to `<x>` when that table exists.

mod error;
mod infer;
pub mod model;
pub mod views;

use std::io::BufRead;

use snafu::prelude::*;
use tracing::info;

pub use error::{SchemaError, SchemaResult};
pub use infer::{ID_SUFFIX, PK_EXCEPTIONS, RECORD_PREFIX};
pub use model::{
    Column, ColumnType, ModelError, ModelMeta, ModelResult, RelationalModel, RowRef, Table, Value,
};
pub use views::{MembershipRecord, ModelViews, ObjectRecord};

use crate::key_resolver::KeyResolver;
use infer::{InferenceGraph, read_records};

/// Integer columns indexed during finalization, as (table, column).
pub const INDEXED_COLUMNS: &[(&str, &str)] = &[
    ("object", "class_id"),
    ("membership", "collection_id"),
    ("membership", "parent_object_id"),
    ("membership", "child_object_id"),
    ("key", "membership_id"),
    ("key", "property_id"),
    ("key_index", "key_id"),
    ("collection", "child_class_id"),
    ("property", "collection_id"),
    ("category", "class_id"),
];

/// Errors from a full ingestion, including the eager key resolver build.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IngestError {
    /// The document could not be turned into tables.
    #[snafu(display("Schema inference failed: {source}"))]
    Schema {
        /// Underlying inference error.
        source: SchemaError,
    },

    /// The tables lack what the key resolver needs.
    #[snafu(display("Key resolver could not be built: {source}"))]
    Keys {
        /// Underlying model error.
        source: ModelError,
    },
}

/// Output of ingestion: the model plus its precomputed key lookups.
#[derive(Debug)]
pub struct IngestedSchema {
    /// Relational model with views and indices.
    pub model: RelationalModel,
    /// (resolution, key id) → destination table.
    pub keys: KeyResolver,
}

/// Streams a metadata description into a [`RelationalModel`].
#[derive(Debug, Default)]
pub struct SchemaIngestor {
    graph: InferenceGraph,
}

impl SchemaIngestor {
    /// Start an empty ingestion.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one complete metadata document.
    pub fn read<R: BufRead>(&mut self, source: R) -> SchemaResult<()> {
        read_records(source, &mut self.graph)
    }

    /// Fix constraints and build views and indices.
    pub fn finish(self) -> RelationalModel {
        let (meta, mut tables) = self.graph.materialize();
        for (table, column) in INDEXED_COLUMNS {
            if let Some(t) = tables.get_mut(*table) {
                t.build_index(column);
            }
        }
        let views = ModelViews::build(&tables);
        info!(
            tables = tables.len(),
            records = meta.record_count,
            objects = views.objects().len(),
            memberships = views.memberships().len(),
            "metadata ingested"
        );
        RelationalModel {
            meta,
            tables,
            views,
        }
    }

    /// Read `source`, finalize, and build the key resolver.
    ///
    /// Documents without a `key_index` table get an empty resolver.
    pub fn ingest<R: BufRead>(source: R) -> Result<IngestedSchema, IngestError> {
        let mut ingestor = SchemaIngestor::new();
        ingestor.read(source).context(SchemaSnafu)?;
        let model = ingestor.finish();
        let keys = if model.table("key_index").is_some() {
            KeyResolver::build(&model).context(KeysSnafu)?
        } else {
            KeyResolver::default()
        };
        Ok(IngestedSchema { model, keys })
    }
}
