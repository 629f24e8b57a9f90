//! On-disk layout of a store.
//!
//! All *relative* path conventions and column names live here. Callers join
//! the returned paths with a [`crate::storage::StoreLocation`] before doing
//! I/O.

use std::path::PathBuf;

use crate::common::{DatasetPath, path_component};

/// Current store format version.
pub const STORE_FORMAT_VERSION: u32 = 2;

/// Producer tag written into the store attributes.
pub const PRODUCER: &str = concat!("plexstore ", env!("CARGO_PKG_VERSION"));

/// Extension of every table file in the store.
pub const TABLE_EXT: &str = "parquet";

// ====================
// Attributes
// ====================

/// Store attributes file at the store root.
pub const ATTRS_FILE_NAME: &str = "_plexstore.json";

/// Relative path: `_plexstore.json`
pub fn attrs_rel_path() -> PathBuf {
    PathBuf::from(ATTRS_FILE_NAME)
}

// ====================
// Identity tables and axes
// ====================

/// Directory holding identity tables and axes.
pub const METADATA_DIR_NAME: &str = "metadata";

/// Relative path: `metadata/objects/`
pub fn objects_rel_dir() -> PathBuf {
    PathBuf::from(METADATA_DIR_NAME).join("objects")
}

/// Relative path: `metadata/relations/`
pub fn relations_rel_dir() -> PathBuf {
    PathBuf::from(METADATA_DIR_NAME).join("relations")
}

/// Relative path: `metadata/times/`
pub fn times_rel_dir() -> PathBuf {
    PathBuf::from(METADATA_DIR_NAME).join("times")
}

/// Relative path: `metadata/objects/<collection>.parquet`
pub fn object_table_rel_path(collection: &str) -> PathBuf {
    objects_rel_dir().join(table_file(collection))
}

/// Relative path: `metadata/relations/<collection>.parquet`
pub fn relation_table_rel_path(collection: &str) -> PathBuf {
    relations_rel_dir().join(table_file(collection))
}

/// Relative path: `metadata/times/<axis>.parquet`, where `axis` is a
/// resolution or phase name.
pub fn axis_rel_path(axis: &str) -> PathBuf {
    times_rel_dir().join(table_file(axis))
}

fn table_file(name: &str) -> String {
    format!("{}.{TABLE_EXT}", path_component(name))
}

/// Object table column: object name.
pub const NAME_COLUMN: &str = "name";
/// Object table column: category name.
pub const CATEGORY_COLUMN: &str = "category";
/// Relation table column: parent object name.
pub const PARENT_COLUMN: &str = "parent";
/// Relation table column: child object name.
pub const CHILD_COLUMN: &str = "child";
/// Axis column: normalized timestamp text.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

// ====================
// Datasets
// ====================

/// Directory holding datasets.
pub const DATA_DIR_NAME: &str = "data";

/// Relative path: `data/<phase>/<resolution>/<collection>/<property>.parquet`
pub fn dataset_rel_path(path: &DatasetPath) -> PathBuf {
    path.rel_path()
}

/// Dataset schema metadata key: unit attribute.
pub const META_UNIT: &str = "unit";
/// Dataset schema metadata key: entity count.
pub const META_ENTITIES: &str = "entities";
/// Dataset schema metadata key: timestep count.
pub const META_TIMESTEPS: &str = "timesteps";
/// Dataset schema metadata key: band count.
pub const META_BANDS: &str = "bands";

/// Dataset column name of a one-based band.
pub fn band_column(band: usize) -> String {
    format!("band_{band}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Phase, Resolution};

    #[test]
    fn paths_follow_conventions() {
        assert_eq!(attrs_rel_path(), PathBuf::from("_plexstore.json"));
        assert_eq!(
            object_table_rel_path("generator"),
            PathBuf::from("metadata/objects/generator.parquet")
        );
        assert_eq!(
            relation_table_rel_path("generator_fuels"),
            PathBuf::from("metadata/relations/generator_fuels.parquet")
        );
        assert_eq!(axis_rel_path("ST"), PathBuf::from("metadata/times/ST.parquet"));
        let dataset = DatasetPath {
            phase: Phase::MediumTerm,
            resolution: Resolution::Month,
            collection: "generator".into(),
            property: "Generation".into(),
        };
        assert_eq!(
            dataset_rel_path(&dataset),
            PathBuf::from("data/MT/month/generator/Generation.parquet")
        );
        assert_eq!(band_column(3), "band_3");
    }
}
