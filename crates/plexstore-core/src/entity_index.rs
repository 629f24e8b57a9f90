//! Dense entity coordinates per collection.
//!
//! Object collections are keyed by object name and carry (name, category)
//! rows; relation collections are keyed by (parent, child) name pairs.
//! Coordinates are positions in discovery order, so they are dense, start at
//! zero, and are reproduced exactly by re-ingesting the same metadata.

use std::collections::{BTreeMap, HashMap, HashSet};

use snafu::prelude::*;
use tracing::{debug, info};

use crate::common::{CollectionId, CollectionKind, ROOT_CLASS};
use crate::schema::{ModelError, RelationalModel};

/// Tables the builder reads.
pub const REQUIRED_TABLES: &[&str] = &["class", "object", "collection", "membership"];

/// Errors raised while building identity tables.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EntityIndexError {
    /// Two objects of one class share a name.
    #[snafu(display("Collection '{collection}' has two objects named '{name}'"))]
    DuplicateObjectName {
        /// Collection identifier.
        collection: String,
        /// Repeated name.
        name: String,
    },

    /// Two memberships of one collection link the same parent and child.
    #[snafu(display("Collection '{collection}' repeats relation '{parent}' -> '{child}'"))]
    DuplicateRelation {
        /// Collection identifier.
        collection: String,
        /// Parent object name.
        parent: String,
        /// Child object name.
        child: String,
    },

    /// The model lacks a table the builder reads.
    #[snafu(display("Entity metadata is incomplete: {source}"))]
    EntityModel {
        /// Underlying model error.
        source: ModelError,
    },
}

/// One row of an object identity table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectEntry {
    /// Object name.
    pub name: String,
    /// Category name, possibly empty.
    pub category: String,
}

/// One row of a relation identity table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationEntry {
    /// Parent object name.
    pub parent: String,
    /// Child object name.
    pub child: String,
}

/// Ordered objects of one class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectIndex {
    entries: Vec<ObjectEntry>,
    by_name: HashMap<String, usize>,
}

impl ObjectIndex {
    /// Build from ordered entries, rejecting repeated names.
    pub fn from_entries(
        collection: &str,
        entries: Vec<ObjectEntry>,
    ) -> Result<Self, EntityIndexError> {
        let mut by_name = HashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            if by_name.insert(entry.name.clone(), idx).is_some() {
                return DuplicateObjectNameSnafu {
                    collection,
                    name: entry.name.as_str(),
                }
                .fail();
            }
        }
        Ok(Self { entries, by_name })
    }

    /// Rows in coordinate order.
    pub fn entries(&self) -> &[ObjectEntry] {
        &self.entries
    }

    /// Coordinate of an object name.
    pub fn coordinate(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection has no entities.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered parent/child pairs of one membership collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationIndex {
    entries: Vec<RelationEntry>,
    by_pair: HashMap<(String, String), usize>,
}

impl RelationIndex {
    /// Build from ordered entries, rejecting repeated pairs.
    pub fn from_entries(
        collection: &str,
        entries: Vec<RelationEntry>,
    ) -> Result<Self, EntityIndexError> {
        let mut by_pair = HashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            let pair = (entry.parent.clone(), entry.child.clone());
            if by_pair.insert(pair, idx).is_some() {
                return DuplicateRelationSnafu {
                    collection,
                    parent: entry.parent.as_str(),
                    child: entry.child.as_str(),
                }
                .fail();
            }
        }
        Ok(Self { entries, by_pair })
    }

    /// Rows in coordinate order.
    pub fn entries(&self) -> &[RelationEntry] {
        &self.entries
    }

    /// Coordinate of a (parent, child) pair.
    pub fn coordinate(&self, parent: &str, child: &str) -> Option<usize> {
        self.by_pair
            .get(&(parent.to_string(), child.to_string()))
            .copied()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the collection has no entities.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Every identity table of one solution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityIndex {
    objects: BTreeMap<String, ObjectIndex>,
    relations: BTreeMap<String, RelationIndex>,
}

impl EntityIndex {
    /// Walk memberships in discovery order and build one identity table per
    /// distinct (collection, parent class, child class).
    pub fn build(model: &RelationalModel) -> Result<Self, EntityIndexError> {
        model.require_tables(REQUIRED_TABLES).context(EntityModelSnafu)?;
        let views = model.views();
        let membership = model.require_table("membership").context(EntityModelSnafu)?;

        let mut index = EntityIndex::default();
        let mut seen: HashSet<(i64, i64, i64)> = HashSet::new();

        for record in views.memberships() {
            if !seen.insert((
                record.collection_id,
                record.parent_class_id,
                record.child_class_id,
            )) {
                continue;
            }

            if record.parent_class == ROOT_CLASS {
                let id = CollectionId::object(&record.child_class);
                if index.objects.contains_key(&id.name) {
                    debug!(collection = %id, "object collection already built");
                    continue;
                }
                let entries = views
                    .objects_of_class(record.child_class_id)
                    .map(|o| ObjectEntry {
                        name: o.name.clone(),
                        category: o.category.clone(),
                    })
                    .collect();
                let objects = ObjectIndex::from_entries(&id.name, entries)?;
                debug!(collection = %id, entities = objects.len(), "object collection indexed");
                index.objects.insert(id.name, objects);
            } else {
                let id = CollectionId::relation(&record.parent_class, &record.collection);
                if index.relations.contains_key(&id.name) {
                    debug!(collection = %id, "relation collection already built");
                    continue;
                }
                let entries = membership
                    .rows_where("collection_id", record.collection_id)
                    .into_iter()
                    .filter_map(|row| views.membership(row.int("membership_id")?))
                    .map(|m| RelationEntry {
                        parent: m.parent_name.clone(),
                        child: m.child_name.clone(),
                    })
                    .collect();
                let relations = RelationIndex::from_entries(&id.name, entries)?;
                debug!(collection = %id, entities = relations.len(), "relation collection indexed");
                index.relations.insert(id.name, relations);
            }
        }

        info!(
            objects = index.objects.len(),
            relations = index.relations.len(),
            "entity index built"
        );
        Ok(index)
    }

    /// Object identity table by collection name.
    pub fn objects(&self, collection: &str) -> Option<&ObjectIndex> {
        self.objects.get(collection)
    }

    /// Relation identity table by collection name.
    pub fn relations(&self, collection: &str) -> Option<&RelationIndex> {
        self.relations.get(collection)
    }

    /// Object collections in name order.
    pub fn object_collections(&self) -> impl Iterator<Item = (&str, &ObjectIndex)> {
        self.objects.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Relation collections in name order.
    pub fn relation_collections(&self) -> impl Iterator<Item = (&str, &RelationIndex)> {
        self.relations.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entities in a collection.
    pub fn entity_count(&self, collection: &CollectionId) -> Option<usize> {
        match collection.kind {
            CollectionKind::Object => self.objects(&collection.name).map(ObjectIndex::len),
            CollectionKind::Relation => self.relations(&collection.name).map(RelationIndex::len),
        }
    }

    /// Coordinate of an entity: the child name alone for objects, the pair
    /// for relations.
    pub fn coordinate(&self, collection: &CollectionId, parent: &str, child: &str) -> Option<usize> {
        match collection.kind {
            CollectionKind::Object => self.objects(&collection.name)?.coordinate(child),
            CollectionKind::Relation => self.relations(&collection.name)?.coordinate(parent, child),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaIngestor;
    use crate::test_util::SolutionFixture;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn model_for(fixture: &SolutionFixture) -> Result<RelationalModel, Box<dyn std::error::Error>> {
        let mut ingestor = SchemaIngestor::new();
        ingestor.read(fixture.metadata_xml().as_bytes())?;
        Ok(ingestor.finish())
    }

    #[test]
    fn coordinates_are_dense_and_unique() -> TestResult {
        let fixture = SolutionFixture::sample();
        let index = EntityIndex::build(&model_for(&fixture)?)?;

        for (_, objects) in index.object_collections() {
            let mut coords: Vec<_> = objects
                .entries()
                .iter()
                .filter_map(|e| objects.coordinate(&e.name))
                .collect();
            coords.sort_unstable();
            assert_eq!(coords, (0..objects.len()).collect::<Vec<_>>());
        }

        let generators = index.objects("generator").expect("generator collection");
        assert_eq!(generators.coordinate("107_CC_1"), Some(1));
        assert_eq!(generators.entries()[0].category, "Coal");

        let fuels = index
            .relations("generator_fuels")
            .expect("generator_fuels collection");
        assert_eq!(fuels.coordinate("107_CC_1", "Gas"), Some(1));
        Ok(())
    }

    #[test]
    fn rebuilding_yields_identical_assignments() -> TestResult {
        let fixture = SolutionFixture::sample();
        let first = EntityIndex::build(&model_for(&fixture)?)?;
        let second = EntityIndex::build(&model_for(&fixture)?)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn rejects_duplicates() {
        let objects = vec![
            ObjectEntry {
                name: "G1".into(),
                category: String::new(),
            },
            ObjectEntry {
                name: "G1".into(),
                category: "Coal".into(),
            },
        ];
        assert!(matches!(
            ObjectIndex::from_entries("generator", objects),
            Err(EntityIndexError::DuplicateObjectName { .. })
        ));

        let pair = RelationEntry {
            parent: "G1".into(),
            child: "Gas".into(),
        };
        assert!(matches!(
            RelationIndex::from_entries("generator_fuels", vec![pair.clone(), pair]),
            Err(EntityIndexError::DuplicateRelation { .. })
        ));
    }
}
