//! Store attributes and the format-version compatibility table.
//!
//! | version | phase axis rule                        | object collection naming |
//! |---------|----------------------------------------|--------------------------|
//! | 1       | stored per-phase axis used directly    | plural (`generators`)    |
//! | 2       | interval axis realigned by offset/len  | singular (`generator`)   |
//!
//! Stores without an attributes file, or whose attributes carry no version,
//! are version 1.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::Phase;
use crate::time_index::Alignment;

use super::layout::STORE_FORMAT_VERSION;

/// Contents of `_plexstore.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StoreAttributes {
    /// Format version tag; absent in the oldest stores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_version: Option<u32>,
    /// Tool that wrote the store.
    #[serde(default)]
    pub producer: String,
    /// Creation time, RFC 3339.
    #[serde(default)]
    pub created_at: String,
    /// Namespace of the source metadata.
    #[serde(default)]
    pub namespace: String,
    /// Root element of the source metadata.
    #[serde(default)]
    pub root_element: String,
    /// Alignment of each phase axis on the interval axis.
    #[serde(default)]
    pub phases: BTreeMap<Phase, Alignment>,
}

/// Known store format versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FormatVersion {
    /// Plural object collections; phase axes used as stored.
    V1,
    /// Singular object collections; interval axes realigned per phase.
    V2,
}

impl FormatVersion {
    /// Version written by this build.
    pub const CURRENT: FormatVersion = FormatVersion::V2;

    /// Map a version tag; `None` for versions this build does not know.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(FormatVersion::V1),
            2 => Some(FormatVersion::V2),
            _ => None,
        }
    }

    /// Numeric tag.
    pub fn tag(self) -> u32 {
        match self {
            FormatVersion::V1 => 1,
            FormatVersion::V2 => STORE_FORMAT_VERSION,
        }
    }

    /// Whether interval queries realign the interval axis by the recorded
    /// phase offset.
    pub fn realigns_phase_axis(self) -> bool {
        self == FormatVersion::V2
    }

    /// Candidate stored directory names for a requested object collection,
    /// most specific first.
    pub fn object_collection_candidates(self, requested: &str) -> Vec<String> {
        let requested = requested.to_lowercase();
        match self {
            FormatVersion::V2 => vec![requested],
            FormatVersion::V1 => {
                let mut names = vec![requested.clone()];
                if let Some(stem) = requested.strip_suffix('y') {
                    names.push(format!("{stem}ies"));
                }
                names.push(format!("{requested}s"));
                names.push(format!("{requested}es"));
                names
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn attributes_round_trip_and_default_missing_fields() -> TestResult {
        let mut attrs = StoreAttributes {
            format_version: Some(STORE_FORMAT_VERSION),
            producer: "plexstore test".into(),
            ..Default::default()
        };
        attrs.phases.insert(
            Phase::ShortTerm,
            Alignment::Offset {
                offset: 0,
                length: 48,
            },
        );
        let json = serde_json::to_string(&attrs)?;
        assert!(json.contains(r#""ST":{"alignment":"offset","offset":0,"length":48}"#));
        assert_eq!(serde_json::from_str::<StoreAttributes>(&json)?, attrs);

        let legacy: StoreAttributes = serde_json::from_str("{}")?;
        assert_eq!(legacy.format_version, None);
        assert!(legacy.phases.is_empty());
        Ok(())
    }

    #[test]
    fn compatibility_rules_per_version() {
        assert_eq!(FormatVersion::from_tag(1), Some(FormatVersion::V1));
        assert_eq!(FormatVersion::from_tag(STORE_FORMAT_VERSION), Some(FormatVersion::CURRENT));
        assert_eq!(FormatVersion::from_tag(9), None);
        assert!(!FormatVersion::V1.realigns_phase_axis());
        assert!(FormatVersion::V2.realigns_phase_axis());

        assert_eq!(
            FormatVersion::V2.object_collection_candidates("Generator"),
            vec!["generator"]
        );
        let v1 = FormatVersion::V1.object_collection_candidates("battery");
        assert!(v1.contains(&"batteries".to_string()));
        assert!(FormatVersion::V1
            .object_collection_candidates("generator")
            .contains(&"generators".to_string()));
    }
}
