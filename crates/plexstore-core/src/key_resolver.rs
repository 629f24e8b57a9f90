//! Precomputed key → dataset coordinate table.
//!
//! Every `key_index` row is joined through key, membership, property, unit,
//! collection, classes and objects once, at ingestion time. Decoding then
//! resolves a run with a single hash lookup on (resolution, key id).

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::common::{CollectionId, Phase, ROOT_CLASS, Resolution};
use crate::schema::{ModelResult, RelationalModel, RowRef, Table};

/// Tables the resolver joins.
pub const REQUIRED_TABLES: &[&str] = &["key_index", "key", "property", "unit"];

/// Everything needed to place one raw series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDestination {
    /// `key.key_id`.
    pub key_id: i64,
    /// Resolution of the run.
    pub resolution: Resolution,
    /// Phase of the key.
    pub phase: Phase,
    /// Destination collection.
    pub collection: CollectionId,
    /// Parent object name.
    pub parent_name: String,
    /// Child object name.
    pub child_name: String,
    /// Property name.
    pub property: String,
    /// `property.property_id`.
    pub property_id: i64,
    /// One-based band of the key.
    pub band: usize,
    /// Highest band over all keys of the property.
    pub band_count: usize,
    /// Base unit.
    pub unit: String,
    /// Unit of summary resolutions.
    pub summary_unit: String,
}

impl KeyDestination {
    /// Unit reported for this destination's resolution.
    pub fn reported_unit(&self) -> &str {
        if self.resolution.is_finest() {
            &self.unit
        } else {
            &self.summary_unit
        }
    }
}

/// Why a key has no destination.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ResolveError {
    /// No joined row for the key.
    #[snafu(display("Key {key_id} has no {resolution} destination"))]
    Unresolved {
        /// Resolution looked up.
        resolution: Resolution,
        /// Key id looked up.
        key_id: i64,
    },

    /// More than one joined row for the key.
    #[snafu(display("Key {key_id} has more than one {resolution} destination"))]
    Ambiguous {
        /// Resolution looked up.
        resolution: Resolution,
        /// Key id looked up.
        key_id: i64,
    },
}

#[derive(Debug, Clone)]
enum Slot {
    Unique(KeyDestination),
    Ambiguous,
}

/// (resolution, key id) → [`KeyDestination`].
#[derive(Debug, Clone, Default)]
pub struct KeyResolver {
    slots: HashMap<(Resolution, i64), Slot>,
}

struct Joins<'a> {
    model: &'a RelationalModel,
    key: &'a Table,
    property: &'a Table,
    unit: &'a Table,
    band_counts: HashMap<i64, usize>,
}

impl<'a> Joins<'a> {
    fn unit_name(&self, unit_id: Option<i64>) -> Option<&'a str> {
        self.unit.by_primary_key(unit_id?)?.text("value")
    }

    /// Inner join of one `key_index` row; `None` on any broken link.
    fn destination(&self, row: RowRef<'_>) -> ModelResult<Option<KeyDestination>> {
        let key_id = row.require_int("key_id")?;
        let code = row.require_int("period_type_id")?;
        let Some(resolution) = Resolution::from_code(code) else {
            debug!(key_id, period_type_id = code, "unknown resolution code");
            return Ok(None);
        };
        let Some(key) = self.key.by_primary_key(key_id) else {
            debug!(key_id, "key_index row references an unknown key");
            return Ok(None);
        };
        let Some(phase) = key.int("phase_id").and_then(Phase::from_code) else {
            debug!(key_id, "key has an unknown phase");
            return Ok(None);
        };
        let Some(membership) = key
            .int("membership_id")
            .and_then(|id| self.model.views().membership(id))
        else {
            debug!(key_id, "key references an unknown membership");
            return Ok(None);
        };
        let Some(property_id) = key.int("property_id") else {
            return Ok(None);
        };
        let Some(property) = self.property.by_primary_key(property_id) else {
            debug!(key_id, property_id, "key references an unknown property");
            return Ok(None);
        };
        let Some(property_name) = property.text("name") else {
            return Ok(None);
        };
        let Some(unit) = self.unit_name(property.int("unit_id")) else {
            debug!(key_id, property_id, "property has no unit");
            return Ok(None);
        };
        let summary_unit = self
            .unit_name(property.int("summary_unit_id"))
            .unwrap_or(unit);

        let collection = if membership.parent_class == ROOT_CLASS {
            CollectionId::object(&membership.child_class)
        } else {
            CollectionId::relation(&membership.parent_class, &membership.collection)
        };
        let band = band_of(&key);

        Ok(Some(KeyDestination {
            key_id,
            resolution,
            phase,
            collection,
            parent_name: membership.parent_name.clone(),
            child_name: membership.child_name.clone(),
            property: property_name.to_string(),
            property_id,
            band,
            band_count: self.band_counts.get(&property_id).copied().unwrap_or(band),
            unit: unit.to_string(),
            summary_unit: summary_unit.to_string(),
        }))
    }
}

fn band_of(key: &RowRef<'_>) -> usize {
    key.int("band_id")
        .and_then(|b| usize::try_from(b).ok())
        .filter(|b| *b >= 1)
        .unwrap_or(1)
}

impl KeyResolver {
    /// Join every `key_index` row and index the results.
    pub fn build(model: &RelationalModel) -> ModelResult<Self> {
        model.require_tables(REQUIRED_TABLES)?;
        let key = model.require_table("key")?;

        let mut band_counts: HashMap<i64, usize> = HashMap::new();
        for row in key.rows() {
            if let Some(property_id) = row.int("property_id") {
                let band = band_of(&row);
                band_counts
                    .entry(property_id)
                    .and_modify(|max| *max = (*max).max(band))
                    .or_insert(band);
            }
        }

        let joins = Joins {
            model,
            key,
            property: model.require_table("property")?,
            unit: model.require_table("unit")?,
            band_counts,
        };

        let mut slots: HashMap<(Resolution, i64), Slot> = HashMap::new();
        let mut excluded = 0usize;
        for row in model.require_table("key_index")?.rows() {
            let Some(dest) = joins.destination(row)? else {
                excluded += 1;
                continue;
            };
            match slots.entry((dest.resolution, dest.key_id)) {
                Entry::Vacant(v) => {
                    v.insert(Slot::Unique(dest));
                }
                Entry::Occupied(mut o) => {
                    warn!(key_id = dest.key_id, resolution = %dest.resolution, "key listed twice for one resolution, marked ambiguous");
                    o.insert(Slot::Ambiguous);
                }
            }
        }

        info!(keys = slots.len(), excluded, "key resolver built");
        Ok(Self { slots })
    }

    /// Destination of a key, or why there is none.
    pub fn resolve(&self, resolution: Resolution, key_id: i64) -> Result<&KeyDestination, ResolveError> {
        match self.slots.get(&(resolution, key_id)) {
            Some(Slot::Unique(dest)) => Ok(dest),
            Some(Slot::Ambiguous) => AmbiguousSnafu { resolution, key_id }.fail(),
            None => UnresolvedSnafu { resolution, key_id }.fail(),
        }
    }

    /// Number of (resolution, key) entries, ambiguous ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing resolved.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
