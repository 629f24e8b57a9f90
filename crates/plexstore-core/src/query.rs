//! Read-only queries over a finished store.
//!
//! [`SolutionStore::open`] detects the store format version, then loads the
//! identity tables and axes. Each query resolves its entity filter against
//! an identity table, reads only the row groups of the selected entities and
//! returns the present values labeled by entity, timestamp and band.
//!
//! Format compatibility:
//!
//! - Object collections of version 1 stores are plural directories; a
//!   singular request is matched against the plural spellings.
//! - Interval queries of version 2 stores label values from the interval axis,
//!   shifted by the phase's recorded offset. Version 1 stores, and phases
//!   whose axis diverged at conversion time, use the stored phase axis.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use arrow::array::{Array, Float64Array};
use chrono::NaiveDateTime;
use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, info};

use crate::common::{CollectionId, CollectionKind, DatasetPath, Phase, Resolution};
use crate::entity_index::{
    EntityIndexError, ObjectEntry, ObjectIndex, RelationEntry, RelationIndex,
};
use crate::storage::{self, StoreLocation};
use crate::store::{
    self, FormatVersion, LoadedTable, StoreAttributes, StoreError, layout,
};
use crate::time_index::Alignment;

/// Errors returned by store queries.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueryError {
    /// A filter is empty or holds an empty name.
    #[snafu(display("Invalid {field} filter: {reason}"))]
    InvalidFilter {
        /// Filter that was rejected.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// No identity table for the collection.
    #[snafu(display("Unknown collection '{collection}'"))]
    UnknownCollection {
        /// Requested collection.
        collection: String,
    },

    /// A filtered name is not in the collection.
    #[snafu(display("Unknown {field} '{name}' in collection '{collection}'"))]
    UnknownEntity {
        /// Collection searched.
        collection: String,
        /// Filter the name came from.
        field: &'static str,
        /// Name not found.
        name: String,
    },

    /// No dataset for the property at this phase and resolution.
    #[snafu(display("Unknown property '{property}' of '{collection}' at {phase}/{resolution}"))]
    UnknownProperty {
        /// Stored collection name.
        collection: String,
        /// Requested property.
        property: String,
        /// Requested phase.
        phase: Phase,
        /// Requested resolution.
        resolution: Resolution,
    },

    /// No stored axis for the requested labels.
    #[snafu(display("Store has no '{axis}' time axis"))]
    MissingAxis {
        /// Axis name.
        axis: String,
    },

    /// The store declares a format version this build cannot read.
    #[snafu(display("Unsupported store format version {version}"))]
    UnsupportedFormatVersion {
        /// Declared version.
        version: u32,
    },

    /// A dataset's layout metadata does not match its contents.
    #[snafu(display("Corrupt dataset {path}: {reason}"))]
    CorruptDataset {
        /// Dataset path.
        path: String,
        /// What is inconsistent.
        reason: String,
    },

    /// An identity table holds duplicate entries.
    #[snafu(display("Corrupt identity table: {source}"))]
    Identity {
        /// Underlying error.
        source: EntityIndexError,
    },

    /// Reading a store file failed.
    #[snafu(display("Store read failed: {source}"))]
    Store {
        /// Underlying error.
        source: StoreError,
    },
}

/// Result alias for queries.
pub type QueryResult<T> = Result<T, QueryError>;

impl From<StoreError> for QueryError {
    fn from(source: StoreError) -> Self {
        match source {
            StoreError::UnsupportedVersion { version } => {
                QueryError::UnsupportedFormatVersion { version }
            }
            source => QueryError::Store { source },
        }
    }
}

/// Name list restricting one identity column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NameFilter {
    /// No restriction.
    #[default]
    Any,
    /// Only these names; every one must exist.
    Only(Vec<String>),
}

impl NameFilter {
    /// Restrict to `names`.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NameFilter::Only(names.into_iter().map(Into::into).collect())
    }

    fn validate(&self, field: &'static str) -> QueryResult<()> {
        if let NameFilter::Only(names) = self {
            ensure!(
                !names.is_empty(),
                InvalidFilterSnafu {
                    field,
                    reason: "name list is empty",
                }
            );
            ensure!(
                names.iter().all(|n| !n.trim().is_empty()),
                InvalidFilterSnafu {
                    field,
                    reason: "name list contains an empty name",
                }
            );
        }
        Ok(())
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            NameFilter::Any => true,
            NameFilter::Only(names) => names.iter().any(|n| n == value),
        }
    }

    /// Fail on the first listed name that no entry carries.
    fn require_present<'a>(
        &self,
        collection: &str,
        field: &'static str,
        present: impl Iterator<Item = &'a str> + Clone,
    ) -> QueryResult<()> {
        if let NameFilter::Only(names) = self {
            for name in names {
                ensure!(
                    present.clone().any(|p| p == name),
                    UnknownEntitySnafu {
                        collection,
                        field,
                        name: name.as_str(),
                    }
                );
            }
        }
        Ok(())
    }
}

/// Entity selection of one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityFilter {
    /// Objects by name and category; both must match.
    Objects {
        /// Object names.
        names: NameFilter,
        /// Category names.
        categories: NameFilter,
    },
    /// Relations by parent and child; both must match.
    Relations {
        /// Parent object names.
        parents: NameFilter,
        /// Child object names.
        children: NameFilter,
    },
}

impl EntityFilter {
    /// Every entity of the collection, object or relation by `kind`.
    pub fn all(kind: CollectionKind) -> Self {
        Self::for_kind(kind, NameFilter::Any, NameFilter::Any)
    }

    /// Filter for `kind` from its primary (names / parents) and secondary
    /// (categories / children) lists.
    pub fn for_kind(kind: CollectionKind, primary: NameFilter, secondary: NameFilter) -> Self {
        match kind {
            CollectionKind::Object => EntityFilter::Objects {
                names: primary,
                categories: secondary,
            },
            CollectionKind::Relation => EntityFilter::Relations {
                parents: primary,
                children: secondary,
            },
        }
    }

    /// Collection kind this filter applies to.
    pub fn kind(&self) -> CollectionKind {
        match self {
            EntityFilter::Objects { .. } => CollectionKind::Object,
            EntityFilter::Relations { .. } => CollectionKind::Relation,
        }
    }

    fn validate(&self) -> QueryResult<()> {
        match self {
            EntityFilter::Objects { names, categories } => {
                names.validate("name")?;
                categories.validate("category")
            }
            EntityFilter::Relations { parents, children } => {
                parents.validate("parent")?;
                children.validate("child")
            }
        }
    }
}

/// Identity of the entity owning a value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum EntityLabel {
    /// An object, identified by (category, name).
    Object {
        /// Category name, possibly empty.
        category: String,
        /// Object name.
        name: String,
    },
    /// A parent/child relation.
    Relation {
        /// Parent object name.
        parent: String,
        /// Child object name.
        child: String,
    },
}

impl fmt::Display for EntityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityLabel::Object { name, .. } => f.write_str(name),
            EntityLabel::Relation { parent, child } => write!(f, "{parent} -> {child}"),
        }
    }
}

/// One present value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    /// Owning entity.
    pub entity: EntityLabel,
    /// Timestamp of the value.
    pub timestamp: NaiveDateTime,
    /// One-based band.
    pub band: usize,
    /// The value.
    pub value: f64,
}

/// Query result: present values sorted by entity, timestamp, then band.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledSeries {
    /// Collection as stored.
    pub collection: String,
    /// Property name.
    pub property: String,
    /// Phase queried.
    pub phase: Phase,
    /// Resolution queried.
    pub resolution: Resolution,
    /// Unit attribute of the dataset.
    pub unit: String,
    /// Present values.
    pub points: Vec<SeriesPoint>,
}

impl LabeledSeries {
    /// Values of one entity in timestamp then band order.
    pub fn values_of(&self, entity: &EntityLabel) -> Vec<f64> {
        self.points
            .iter()
            .filter(|p| &p.entity == entity)
            .map(|p| p.value)
            .collect()
    }
}

/// A store opened for reading.
#[derive(Debug, Clone)]
pub struct SolutionStore {
    location: StoreLocation,
    attributes: StoreAttributes,
    version: FormatVersion,
    objects: BTreeMap<String, ObjectIndex>,
    relations: BTreeMap<String, RelationIndex>,
    axes: BTreeMap<String, Vec<NaiveDateTime>>,
}

impl SolutionStore {
    /// Open the store at `location`, loading its identity tables and axes.
    pub async fn open(location: StoreLocation) -> QueryResult<Self> {
        let attrs = store::read_attributes(&location).await?;
        let version = store::detect_version(attrs.as_ref())?;
        let attributes = attrs.unwrap_or_default();

        let mut objects = BTreeMap::new();
        for name in list_tables(&location, &layout::objects_rel_dir()).await? {
            let table =
                LoadedTable::load(&location, &layout::object_table_rel_path(&name)).await?;
            let mut columns =
                table.read_text_columns(&[layout::NAME_COLUMN, layout::CATEGORY_COLUMN])?;
            let categories = columns.pop().unwrap_or_default();
            let names = columns.pop().unwrap_or_default();
            let entries = names
                .into_iter()
                .zip(categories)
                .map(|(name, category)| ObjectEntry { name, category })
                .collect();
            let index = ObjectIndex::from_entries(&name, entries).context(IdentitySnafu)?;
            objects.insert(name, index);
        }

        let mut relations = BTreeMap::new();
        for name in list_tables(&location, &layout::relations_rel_dir()).await? {
            let table =
                LoadedTable::load(&location, &layout::relation_table_rel_path(&name)).await?;
            let mut columns =
                table.read_text_columns(&[layout::PARENT_COLUMN, layout::CHILD_COLUMN])?;
            let children = columns.pop().unwrap_or_default();
            let parents = columns.pop().unwrap_or_default();
            let entries = parents
                .into_iter()
                .zip(children)
                .map(|(parent, child)| RelationEntry { parent, child })
                .collect();
            let index = RelationIndex::from_entries(&name, entries).context(IdentitySnafu)?;
            relations.insert(name, index);
        }

        let mut axes = BTreeMap::new();
        for name in list_tables(&location, &layout::times_rel_dir()).await? {
            let axis = store::read_axis(&location, &name).await?;
            axes.insert(name, axis);
        }

        info!(
            store = %location,
            version = version.tag(),
            objects = objects.len(),
            relations = relations.len(),
            axes = axes.len(),
            "store opened"
        );
        Ok(Self {
            location,
            attributes,
            version,
            objects,
            relations,
            axes,
        })
    }

    /// Where the store lives.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Detected format version.
    pub fn format_version(&self) -> FormatVersion {
        self.version
    }

    /// Store attributes; defaults for stores without an attributes file.
    pub fn attributes(&self) -> &StoreAttributes {
        &self.attributes
    }

    /// Stored object collection names.
    pub fn object_collections(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// Stored relation collection names.
    pub fn relation_collections(&self) -> impl Iterator<Item = &str> {
        self.relations.keys().map(String::as_str)
    }

    /// Identity table of an object collection, resolving legacy naming.
    pub fn objects(&self, collection: &str) -> Option<&ObjectIndex> {
        self.object_collection(collection)
            .and_then(|name| self.objects.get(name))
    }

    /// Identity table of a relation collection.
    pub fn relations(&self, collection: &str) -> Option<&RelationIndex> {
        self.relations.get(&collection.to_lowercase())
    }

    /// Stored axis by resolution or phase name.
    pub fn axis(&self, name: &str) -> Option<&[NaiveDateTime]> {
        self.axes.get(name).map(Vec::as_slice)
    }

    /// Properties stored for a collection at one phase and resolution.
    pub async fn properties(
        &self,
        collection: &str,
        resolution: Resolution,
        phase: Phase,
    ) -> QueryResult<Vec<String>> {
        let stored = self.stored_collection(collection, CollectionId::classify(collection))?;
        let dir = DatasetPath {
            phase,
            resolution,
            collection: stored.to_string(),
            property: String::new(),
        }
        .rel_path();
        let Some(dir) = dir.parent() else {
            return Ok(Vec::new());
        };
        Ok(list_tables(&self.location, dir).await?)
    }

    fn object_collection(&self, requested: &str) -> Option<&str> {
        self.version
            .object_collection_candidates(requested)
            .into_iter()
            .find_map(|name| self.objects.get_key_value(&name).map(|(k, _)| k.as_str()))
    }

    fn stored_collection(&self, requested: &str, kind: CollectionKind) -> QueryResult<&str> {
        let found = match kind {
            CollectionKind::Object => self.object_collection(requested),
            CollectionKind::Relation => self
                .relations
                .get_key_value(&requested.to_lowercase())
                .map(|(k, _)| k.as_str()),
        };
        found.context(UnknownCollectionSnafu {
            collection: requested,
        })
    }

    /// Values of an object property.
    pub async fn query_object_property(
        &self,
        collection: &str,
        property: &str,
        names: NameFilter,
        categories: NameFilter,
        resolution: Resolution,
        phase: Phase,
    ) -> QueryResult<LabeledSeries> {
        let filter = EntityFilter::Objects { names, categories };
        self.query_filtered(collection, property, &filter, resolution, phase)
            .await
    }

    /// Values of a relation property.
    pub async fn query_relation_property(
        &self,
        collection: &str,
        property: &str,
        parents: NameFilter,
        children: NameFilter,
        resolution: Resolution,
        phase: Phase,
    ) -> QueryResult<LabeledSeries> {
        let filter = EntityFilter::Relations { parents, children };
        self.query_filtered(collection, property, &filter, resolution, phase)
            .await
    }

    /// Route to the object or relation query by the collection's naming:
    /// identifiers containing `_` are relations.
    pub async fn query(
        &self,
        collection: &str,
        property: &str,
        primary: NameFilter,
        secondary: NameFilter,
        resolution: Resolution,
        phase: Phase,
    ) -> QueryResult<LabeledSeries> {
        let filter = EntityFilter::for_kind(CollectionId::classify(collection), primary, secondary);
        self.query_filtered(collection, property, &filter, resolution, phase)
            .await
    }

    /// Values of `property` for the entities of `collection` matching `filter`.
    pub async fn query_filtered(
        &self,
        collection: &str,
        property: &str,
        filter: &EntityFilter,
        resolution: Resolution,
        phase: Phase,
    ) -> QueryResult<LabeledSeries> {
        filter.validate()?;
        let stored = self.stored_collection(collection, filter.kind())?;
        let selection = self.select(stored, filter)?;
        self.read_series(stored, property, selection, resolution, phase)
            .await
    }

    /// Ascending (coordinate, label) pairs matching `filter`.
    fn select(&self, stored: &str, filter: &EntityFilter) -> QueryResult<Vec<(usize, EntityLabel)>> {
        match filter {
            EntityFilter::Objects { names, categories } => {
                let index = self.objects.get(stored).context(UnknownCollectionSnafu {
                    collection: stored,
                })?;
                let entries = index.entries();
                names.require_present(stored, "name", entries.iter().map(|e| e.name.as_str()))?;
                categories.require_present(
                    stored,
                    "category",
                    entries.iter().map(|e| e.category.as_str()),
                )?;
                Ok(entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| names.matches(&e.name) && categories.matches(&e.category))
                    .map(|(i, e)| {
                        (
                            i,
                            EntityLabel::Object {
                                category: e.category.clone(),
                                name: e.name.clone(),
                            },
                        )
                    })
                    .collect())
            }
            EntityFilter::Relations { parents, children } => {
                let index = self.relations.get(stored).context(UnknownCollectionSnafu {
                    collection: stored,
                })?;
                let entries = index.entries();
                parents.require_present(stored, "parent", entries.iter().map(|e| e.parent.as_str()))?;
                children.require_present(stored, "child", entries.iter().map(|e| e.child.as_str()))?;
                Ok(entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| parents.matches(&e.parent) && children.matches(&e.child))
                    .map(|(i, e)| {
                        (
                            i,
                            EntityLabel::Relation {
                                parent: e.parent.clone(),
                                child: e.child.clone(),
                            },
                        )
                    })
                    .collect())
            }
        }
    }

    /// Timestamp labels for stored positions of a (resolution, phase) dataset.
    fn labels(&self, resolution: Resolution, phase: Phase) -> QueryResult<&[NaiveDateTime]> {
        if resolution != Resolution::Interval {
            return self
                .axis(resolution.as_str())
                .context(MissingAxisSnafu {
                    axis: resolution.as_str(),
                });
        }

        let alignment = self.attributes.phases.get(&phase).copied();
        if let (true, Some(Alignment::Offset { offset, length })) =
            (self.version.realigns_phase_axis(), alignment)
        {
            let interval = self.axis(resolution.as_str()).context(MissingAxisSnafu {
                axis: resolution.as_str(),
            })?;
            let end = (offset + length).min(interval.len());
            return Ok(interval.get(offset.min(end)..end).unwrap_or_default());
        }
        self.axis(phase.as_str())
            .or_else(|| self.axis(resolution.as_str()))
            .context(MissingAxisSnafu {
                axis: phase.as_str(),
            })
    }

    async fn read_series(
        &self,
        stored: &str,
        property: &str,
        selection: Vec<(usize, EntityLabel)>,
        resolution: Resolution,
        phase: Phase,
    ) -> QueryResult<LabeledSeries> {
        let path = DatasetPath {
            phase,
            resolution,
            collection: stored.to_string(),
            property: property.to_string(),
        };
        let table = match LoadedTable::load(&self.location, &path.rel_path()).await {
            Ok(table) => table,
            Err(StoreError::StoreIo { source }) if source.is_not_found() => {
                return UnknownPropertySnafu {
                    collection: stored,
                    property,
                    phase,
                    resolution,
                }
                .fail();
            }
            Err(e) => return Err(e.into()),
        };

        let schema = table.schema()?;
        let metadata = schema.metadata();
        let unit = metadata.get(layout::META_UNIT).cloned().unwrap_or_default();
        let group_rows = table.row_group_rows()?;
        let timesteps = match metadata
            .get(layout::META_TIMESTEPS)
            .and_then(|t| t.parse::<usize>().ok())
        {
            Some(t) => t,
            None => group_rows.first().copied().unwrap_or(0),
        };
        ensure!(
            timesteps > 0 || group_rows.iter().all(|r| *r == 0),
            CorruptDatasetSnafu {
                path: table.path(),
                reason: "dataset has rows but no timesteps",
            }
        );
        let labels = self.labels(resolution, phase)?;

        let mut series = LabeledSeries {
            collection: stored.to_string(),
            property: property.to_string(),
            phase,
            resolution,
            unit,
            points: Vec::new(),
        };
        if selection.is_empty() || timesteps == 0 {
            return Ok(series);
        }

        let wanted: BTreeMap<usize, &EntityLabel> =
            selection.iter().map(|(coord, label)| (*coord, label)).collect();

        // Row groups overlapping any selected entity's rows.
        let mut starts = Vec::with_capacity(group_rows.len());
        let mut start = 0usize;
        for rows in &group_rows {
            starts.push(start);
            start += rows;
        }
        let mut groups = BTreeSet::new();
        for coord in wanted.keys() {
            let (lo, hi) = (coord * timesteps, (coord + 1) * timesteps);
            for (g, (rows, s)) in group_rows.iter().zip(&starts).enumerate() {
                if *s < hi && s + rows > lo {
                    groups.insert(g);
                }
            }
        }
        debug!(dataset = %path, entities = wanted.len(), row_groups = groups.len(), "reading dataset");

        let mut rows = groups
            .iter()
            .flat_map(|g| starts[*g]..starts[*g] + group_rows[*g]);
        let batches = table.read(Some(groups.iter().copied().collect()))?;
        let band_names: Vec<(usize, String)> = (1..=schema.fields().len())
            .map(|b| (b, layout::band_column(b)))
            .collect();

        for batch in batches {
            let columns = band_names
                .iter()
                .map(|(band, name)| {
                    batch
                        .column_by_name(name)
                        .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
                        .map(|c| (*band, c))
                        .context(CorruptDatasetSnafu {
                            path: table.path(),
                            reason: format!("column {name} is not f64"),
                        })
                })
                .collect::<QueryResult<Vec<_>>>()?;

            for i in 0..batch.num_rows() {
                let Some(row) = rows.next() else {
                    return CorruptDatasetSnafu {
                        path: table.path(),
                        reason: "more rows than row group metadata declares",
                    }
                    .fail();
                };
                let (entity, t) = (row / timesteps, row % timesteps);
                let (Some(label), Some(timestamp)) = (wanted.get(&entity), labels.get(t)) else {
                    continue;
                };
                for (band, column) in &columns {
                    if column.is_null(i) {
                        continue;
                    }
                    series.points.push(SeriesPoint {
                        entity: (*label).clone(),
                        timestamp: *timestamp,
                        band: *band,
                        value: column.value(i),
                    });
                }
            }
        }

        series.points.sort_by(|a, b| {
            a.entity
                .cmp(&b.entity)
                .then(a.timestamp.cmp(&b.timestamp))
                .then(a.band.cmp(&b.band))
        });
        debug!(dataset = %path, points = series.points.len(), "query answered");
        Ok(series)
    }
}

async fn list_tables(location: &StoreLocation, rel_dir: &std::path::Path) -> QueryResult<Vec<String>> {
    storage::list_files(location, rel_dir, layout::TABLE_EXT)
        .await
        .map_err(|source| QueryError::Store {
            source: StoreError::StoreIo { source },
        })
}
