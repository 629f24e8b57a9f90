//! Identifiers shared by the conversion stages and the query engine.
//!
//! Resolutions and phases arrive from the metadata as small integer codes
//! (`period_type_id`, `phase_id`); everything downstream of ingestion works
//! with the typed enums below and their stable lowercase/uppercase names,
//! which double as store path components.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Name of the synthetic root class. Memberships whose parent belongs to it
/// bind plain object properties.
pub const ROOT_CLASS: &str = "System";

/// Separator between the parent class and the collection name in relation
/// collection identifiers (for example `generator_fuels`).
pub const RELATION_SEPARATOR: char = '_';

/// Error returned when a resolution or phase name/code is not recognised.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum ParseIdentError {
    /// Unknown resolution name or code.
    #[snafu(display("Unknown resolution: {value}"))]
    UnknownResolution {
        /// Offending input.
        value: String,
    },
    /// Unknown phase name or code.
    #[snafu(display("Unknown phase: {value}"))]
    UnknownPhase {
        /// Offending input.
        value: String,
    },
}

/// Temporal granularity of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Finest resolution (`period_type_id` 0).
    Interval,
    /// Daily summaries (1).
    Day,
    /// Weekly summaries (2).
    Week,
    /// Monthly summaries (3).
    Month,
    /// Yearly summaries (4).
    Year,
}

impl Resolution {
    /// Every resolution, in code order.
    pub const ALL: [Resolution; 5] = [
        Resolution::Interval,
        Resolution::Day,
        Resolution::Week,
        Resolution::Month,
        Resolution::Year,
    ];

    /// Map a `period_type_id` to a resolution.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Resolution::Interval),
            1 => Some(Resolution::Day),
            2 => Some(Resolution::Week),
            3 => Some(Resolution::Month),
            4 => Some(Resolution::Year),
            _ => None,
        }
    }

    /// The `period_type_id` of this resolution.
    pub fn code(self) -> i64 {
        match self {
            Resolution::Interval => 0,
            Resolution::Day => 1,
            Resolution::Week => 2,
            Resolution::Month => 3,
            Resolution::Year => 4,
        }
    }

    /// Store path component and user-facing name.
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Interval => "interval",
            Resolution::Day => "day",
            Resolution::Week => "week",
            Resolution::Month => "month",
            Resolution::Year => "year",
        }
    }

    /// Whether this is the finest resolution, which reports base units.
    pub fn is_finest(self) -> bool {
        self == Resolution::Interval
    }

    /// Name of the metadata table holding this resolution's periods.
    pub fn period_table(self) -> String {
        format!("period_{}", self.code())
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = ParseIdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolution::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .context(UnknownResolutionSnafu { value: s })
    }
}

/// Analysis stage of a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Long-term planning (`phase_id` 1).
    #[serde(rename = "LT")]
    LongTerm,
    /// Projected assessment of system adequacy (2).
    #[serde(rename = "PASA")]
    Pasa,
    /// Medium-term schedule (3).
    #[serde(rename = "MT")]
    MediumTerm,
    /// Short-term schedule (4).
    #[serde(rename = "ST")]
    ShortTerm,
}

impl Phase {
    /// Every phase, in code order.
    pub const ALL: [Phase; 4] = [
        Phase::LongTerm,
        Phase::Pasa,
        Phase::MediumTerm,
        Phase::ShortTerm,
    ];

    /// Map a `phase_id` to a phase.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Phase::LongTerm),
            2 => Some(Phase::Pasa),
            3 => Some(Phase::MediumTerm),
            4 => Some(Phase::ShortTerm),
            _ => None,
        }
    }

    /// The `phase_id` of this phase.
    pub fn code(self) -> i64 {
        match self {
            Phase::LongTerm => 1,
            Phase::Pasa => 2,
            Phase::MediumTerm => 3,
            Phase::ShortTerm => 4,
        }
    }

    /// Store path component and user-facing name.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::LongTerm => "LT",
            Phase::Pasa => "PASA",
            Phase::MediumTerm => "MT",
            Phase::ShortTerm => "ST",
        }
    }

    /// Name of the metadata table mapping intervals to this phase's periods.
    pub fn phase_table(self) -> String {
        format!("phase_{}", self.code())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ParseIdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .context(UnknownPhaseSnafu { value: s })
    }
}

/// Whether a collection is addressed by object identity or by parent/child
/// relation identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    /// Rows keyed by (category, name) of objects of one class.
    Object,
    /// Rows keyed by (parent name, child name) of one membership collection.
    Relation,
}

/// Identifier of an entity collection in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionId {
    /// Lowercased collection identifier used as a path component.
    pub name: String,
    /// Object or relation addressing.
    pub kind: CollectionKind,
}

impl CollectionId {
    /// Object collection for a child class: the lowercased class name.
    pub fn object(child_class: &str) -> Self {
        CollectionId {
            name: child_class.to_lowercase(),
            kind: CollectionKind::Object,
        }
    }

    /// Relation collection: lowercased `<parent class>_<collection>` with
    /// spaces removed from the collection name.
    pub fn relation(parent_class: &str, collection: &str) -> Self {
        let collection: String = collection.chars().filter(|c| *c != ' ').collect();
        CollectionId {
            name: format!("{parent_class}{RELATION_SEPARATOR}{collection}").to_lowercase(),
            kind: CollectionKind::Relation,
        }
    }

    /// Classify a user-supplied collection identifier by naming convention.
    pub fn classify(name: &str) -> CollectionKind {
        if name.contains(RELATION_SEPARATOR) {
            CollectionKind::Relation
        } else {
            CollectionKind::Object
        }
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Address of one dataset: `data/<phase>/<resolution>/<collection>/<property>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetPath {
    /// Analysis phase.
    pub phase: Phase,
    /// Time resolution.
    pub resolution: Resolution,
    /// Collection directory name as stored.
    pub collection: String,
    /// Property name.
    pub property: String,
}

impl DatasetPath {
    /// Relative file path of the dataset inside a store.
    pub fn rel_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from("data")
            .join(self.phase.as_str())
            .join(self.resolution.as_str())
            .join(path_component(&self.collection))
            .join(format!("{}.parquet", path_component(&self.property)))
    }
}

impl fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/data/{}/{}/{}/{}",
            self.phase, self.resolution, self.collection, self.property
        )
    }
}

/// Make a name safe to use as a single path component.
pub fn path_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect()
}
