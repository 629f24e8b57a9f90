//! Derived lookup views over the object graph.
//!
//! Both views use inner-join semantics: a row whose class, collection or
//! object link points nowhere is left out. A missing category is not a broken
//! link; such objects carry the empty category.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use super::model::Table;

/// One object joined with its class and category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    /// `object.object_id`.
    pub object_id: i64,
    /// `object.class_id`.
    pub class_id: i64,
    /// Name of the object's class.
    pub class_name: String,
    /// Object name.
    pub name: String,
    /// Category name, empty when the object has none.
    pub category: String,
}

/// One membership joined with its collection, classes and objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRecord {
    /// `membership.membership_id`.
    pub membership_id: i64,
    /// `membership.collection_id`.
    pub collection_id: i64,
    /// Collection name.
    pub collection: String,
    /// Parent class id.
    pub parent_class_id: i64,
    /// Parent class name.
    pub parent_class: String,
    /// Child class id.
    pub child_class_id: i64,
    /// Child class name.
    pub child_class: String,
    /// Parent object id.
    pub parent_object_id: i64,
    /// Parent object name.
    pub parent_name: String,
    /// Child object id.
    pub child_object_id: i64,
    /// Child object name.
    pub child_name: String,
}

/// Object and membership views with their id lookups.
#[derive(Debug, Clone, Default)]
pub struct ModelViews {
    objects: Vec<ObjectRecord>,
    objects_by_id: HashMap<i64, usize>,
    objects_by_class: HashMap<i64, Vec<usize>>,
    memberships: Vec<MembershipRecord>,
    memberships_by_id: HashMap<i64, usize>,
}

impl ModelViews {
    pub(crate) fn build(tables: &BTreeMap<String, Table>) -> Self {
        let mut views = ModelViews::default();
        let (Some(object), Some(class)) = (tables.get("object"), tables.get("class")) else {
            return views;
        };
        let category = tables.get("category");

        for row in object.rows() {
            let (Some(object_id), Some(class_id), Some(name)) = (
                row.int("object_id"),
                row.int("class_id"),
                row.text("name"),
            ) else {
                debug!(row = row.index(), "object row without id, class or name left out of view");
                continue;
            };
            let Some(class_name) = class.by_primary_key(class_id).and_then(|c| c.text("name"))
            else {
                debug!(object_id, class_id, "object with unknown class left out of view");
                continue;
            };
            let category_name = row
                .int("category_id")
                .zip(category)
                .and_then(|(id, table)| table.by_primary_key(id))
                .and_then(|c| c.text("name"))
                .unwrap_or_default();

            let idx = views.objects.len();
            views.objects.push(ObjectRecord {
                object_id,
                class_id,
                class_name: class_name.to_string(),
                name: name.to_string(),
                category: category_name.to_string(),
            });
            views.objects_by_id.insert(object_id, idx);
            views.objects_by_class.entry(class_id).or_default().push(idx);
        }

        let (Some(membership), Some(collection)) =
            (tables.get("membership"), tables.get("collection"))
        else {
            return views;
        };

        for row in membership.rows() {
            let Some(record) = views.join_membership(row, collection, class) else {
                debug!(row = row.index(), "membership with a broken link left out of view");
                continue;
            };
            views
                .memberships_by_id
                .insert(record.membership_id, views.memberships.len());
            views.memberships.push(record);
        }

        views
    }

    fn join_membership(
        &self,
        row: super::model::RowRef<'_>,
        collection: &Table,
        class: &Table,
    ) -> Option<MembershipRecord> {
        let membership_id = row.int("membership_id")?;
        let collection_id = row.int("collection_id")?;
        let parent_class_id = row.int("parent_class_id")?;
        let child_class_id = row.int("child_class_id")?;
        let parent = self.object(row.int("parent_object_id")?)?;
        let child = self.object(row.int("child_object_id")?)?;
        let collection_name = collection.by_primary_key(collection_id)?.text("name")?;
        let parent_class = class.by_primary_key(parent_class_id)?.text("name")?;
        let child_class = class.by_primary_key(child_class_id)?.text("name")?;

        Some(MembershipRecord {
            membership_id,
            collection_id,
            collection: collection_name.to_string(),
            parent_class_id,
            parent_class: parent_class.to_string(),
            child_class_id,
            child_class: child_class.to_string(),
            parent_object_id: parent.object_id,
            parent_name: parent.name.clone(),
            child_object_id: child.object_id,
            child_name: child.name.clone(),
        })
    }

    /// All objects in metadata order.
    pub fn objects(&self) -> &[ObjectRecord] {
        &self.objects
    }

    /// Object by id.
    pub fn object(&self, object_id: i64) -> Option<&ObjectRecord> {
        self.objects_by_id.get(&object_id).map(|&i| &self.objects[i])
    }

    /// Objects of one class, in metadata order.
    pub fn objects_of_class(&self, class_id: i64) -> impl Iterator<Item = &ObjectRecord> {
        self.objects_by_class
            .get(&class_id)
            .into_iter()
            .flatten()
            .map(|&i| &self.objects[i])
    }

    /// All memberships in metadata order.
    pub fn memberships(&self) -> &[MembershipRecord] {
        &self.memberships
    }

    /// Membership by id.
    pub fn membership(&self, membership_id: i64) -> Option<&MembershipRecord> {
        self.memberships_by_id
            .get(&membership_id)
            .map(|&i| &self.memberships[i])
    }
}
