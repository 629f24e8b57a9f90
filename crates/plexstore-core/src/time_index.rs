//! Timestamp axes per resolution and per phase.
//!
//! Every resolution with a period table gets one ordered axis. Phases that
//! appear in the `key` table get a derived axis: for each phase period, the
//! earliest interval timestamp mapped to it. Whether that axis is a plain
//! window onto the interval axis is recorded as its [`Alignment`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::common::{Phase, Resolution};
use crate::schema::{ModelError, RelationalModel};

/// Output format of normalized timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

/// Errors raised while building time axes.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TimeIndexError {
    /// A period table holds a timestamp in no accepted format.
    #[snafu(display("Unparseable timestamp '{value}' in {table}.{column}"))]
    UnparseableTimestamp {
        /// Source table.
        table: String,
        /// Source column.
        column: String,
        /// Offending text.
        value: String,
    },

    /// A required table or value is missing.
    #[snafu(display("Time axis metadata is incomplete: {source}"))]
    TimeModel {
        /// Underlying model error.
        source: ModelError,
    },
}

type TimeResult<T> = Result<T, TimeIndexError>;

/// Where a phase axis sits on the interval axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "alignment", rename_all = "lowercase")]
pub enum Alignment {
    /// The phase axis equals `interval[offset..offset + length]`.
    Offset {
        /// First interval position covered by the phase.
        offset: usize,
        /// Number of phase periods.
        length: usize,
    },
    /// The phase axis is not a contiguous window of the interval axis.
    Divergent,
}

/// Derived axis for one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseAxis {
    /// Phase the axis belongs to.
    pub phase: Phase,
    /// Ordered timestamps, one per phase period.
    pub timestamps: Vec<NaiveDateTime>,
    /// Position relative to the interval axis.
    pub alignment: Alignment,
}

/// Parse a metadata timestamp in any accepted layout.
///
/// A trailing `Z` or `±HH:MM` offset is dropped and the wall-clock time kept.
pub fn normalize_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = strip_zone(text.trim());
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

/// Render a timestamp in the normalized layout.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn strip_zone(text: &str) -> &str {
    if let Some(stripped) = text.strip_suffix('Z') {
        return stripped;
    }
    let bytes = text.as_bytes();
    let n = bytes.len();
    if n > 6
        && matches!(bytes[n - 6], b'+' | b'-')
        && bytes[n - 3] == b':'
        && bytes[n - 7].is_ascii_digit()
    {
        return &text[..n - 6];
    }
    text
}

/// Timestamp and order columns of a resolution's period table, or `None`
/// when the resolution has no known layout.
pub fn source_layout(resolution: Resolution) -> Option<(&'static str, &'static str)> {
    match resolution {
        Resolution::Interval => Some(("datetime", "interval_id")),
        Resolution::Day => Some(("date", "day_id")),
        Resolution::Week => None,
        Resolution::Month => Some(("month_beginning", "month_id")),
        Resolution::Year => Some(("year_ending", "fiscal_year_id")),
    }
}

/// All axes of one solution.
#[derive(Debug, Clone, Default)]
pub struct TimeIndex {
    axes: BTreeMap<Resolution, Vec<NaiveDateTime>>,
    unsupported: BTreeSet<Resolution>,
    phases: BTreeMap<Phase, PhaseAxis>,
}

impl TimeIndex {
    /// Build every resolution axis and every phase axis the model supports.
    pub fn build(model: &RelationalModel) -> TimeResult<Self> {
        let mut index = TimeIndex::default();

        for resolution in Resolution::ALL {
            let table_name = resolution.period_table();
            let Some(table) = model.table(&table_name) else {
                continue;
            };
            let Some((ts_col, order_col)) = source_layout(resolution) else {
                warn!(%resolution, table = %table_name, "resolution is not supported, its values will be skipped");
                index.unsupported.insert(resolution);
                continue;
            };

            let mut rows = Vec::with_capacity(table.len());
            for row in table.rows() {
                let order = row.require_int(order_col).context(TimeModelSnafu)?;
                let text = row.require_text(ts_col).context(TimeModelSnafu)?;
                let ts = normalize_timestamp(text).context(UnparseableTimestampSnafu {
                    table: table_name.as_str(),
                    column: ts_col,
                    value: text,
                })?;
                rows.push((order, ts));
            }
            rows.sort_by_key(|(order, _)| *order);
            debug!(%resolution, timesteps = rows.len(), "time axis built");
            index
                .axes
                .insert(resolution, rows.into_iter().map(|(_, ts)| ts).collect());
        }

        index.build_phases(model)?;
        info!(
            resolutions = index.axes.len(),
            phases = index.phases.len(),
            "time axes built"
        );
        Ok(index)
    }

    fn build_phases(&mut self, model: &RelationalModel) -> TimeResult<()> {
        let Some(key) = model.table("key") else {
            return Ok(());
        };
        let mut phase_ids = BTreeSet::new();
        for row in key.rows() {
            if let Some(id) = row.int("phase_id") {
                phase_ids.insert(id);
            }
        }
        if phase_ids.is_empty() {
            return Ok(());
        }

        let Some(interval_table) = model.table(&Resolution::Interval.period_table()) else {
            warn!("no interval periods, phase axes cannot be derived");
            return Ok(());
        };
        let mut interval_ts: HashMap<i64, NaiveDateTime> = HashMap::new();
        for row in interval_table.rows() {
            let id = row.require_int("interval_id").context(TimeModelSnafu)?;
            let text = row.require_text("datetime").context(TimeModelSnafu)?;
            let ts = normalize_timestamp(text).context(UnparseableTimestampSnafu {
                table: interval_table.name(),
                column: "datetime",
                value: text,
            })?;
            interval_ts.insert(id, ts);
        }
        let interval_axis = self.axes.get(&Resolution::Interval).cloned().unwrap_or_default();

        for id in phase_ids {
            let Some(phase) = Phase::from_code(id) else {
                warn!(phase_id = id, "unknown phase id, keys of this phase will be skipped");
                continue;
            };
            let table_name = phase.phase_table();
            let Some(table) = model.table(&table_name) else {
                warn!(%phase, table = %table_name, "phase table missing, phase axis skipped");
                continue;
            };

            let mut periods: BTreeMap<i64, NaiveDateTime> = BTreeMap::new();
            for row in table.rows() {
                let interval_id = row.require_int("interval_id").context(TimeModelSnafu)?;
                let period_id = row.require_int("period_id").context(TimeModelSnafu)?;
                let Some(ts) = interval_ts.get(&interval_id) else {
                    debug!(%phase, interval_id, "phase row references an unknown interval");
                    continue;
                };
                periods
                    .entry(period_id)
                    .and_modify(|cur| *cur = (*cur).min(*ts))
                    .or_insert(*ts);
            }

            let timestamps: Vec<NaiveDateTime> = periods.into_values().collect();
            let alignment = align(&interval_axis, &timestamps);
            if alignment == Alignment::Divergent {
                warn!(%phase, periods = timestamps.len(), "phase axis diverges from the interval axis, stored axis will be used");
            }
            self.phases.insert(
                phase,
                PhaseAxis {
                    phase,
                    timestamps,
                    alignment,
                },
            );
        }
        Ok(())
    }

    /// Axis of a resolution, if built.
    pub fn axis(&self, resolution: Resolution) -> Option<&[NaiveDateTime]> {
        self.axes.get(&resolution).map(Vec::as_slice)
    }

    /// Number of timesteps of a resolution, if built.
    pub fn timesteps(&self, resolution: Resolution) -> Option<usize> {
        self.axes.get(&resolution).map(Vec::len)
    }

    /// Whether the resolution has periods but no supported layout.
    pub fn is_unsupported(&self, resolution: Resolution) -> bool {
        self.unsupported.contains(&resolution)
    }

    /// Resolutions that have an axis.
    pub fn resolutions(&self) -> impl Iterator<Item = Resolution> + '_ {
        self.axes.keys().copied()
    }

    /// Derived axis of a phase.
    pub fn phase(&self, phase: Phase) -> Option<&PhaseAxis> {
        self.phases.get(&phase)
    }

    /// All derived phase axes.
    pub fn phases(&self) -> impl Iterator<Item = &PhaseAxis> {
        self.phases.values()
    }
}

/// Locate `phase` as a contiguous window of `interval`.
pub fn align(interval: &[NaiveDateTime], phase: &[NaiveDateTime]) -> Alignment {
    let Some(first) = phase.first() else {
        return Alignment::Offset {
            offset: 0,
            length: 0,
        };
    };
    match interval.iter().position(|t| t == first) {
        Some(offset) if interval[offset..].starts_with(phase) => Alignment::Offset {
            offset,
            length: phase.len(),
        },
        _ => Alignment::Divergent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(text: &str) -> NaiveDateTime {
        normalize_timestamp(text).expect("valid timestamp")
    }

    #[test]
    fn normalizes_accepted_layouts() {
        let expected = "2024-01-01T13:00:00";
        for input in [
            "2024-01-01T13:00:00",
            "2024-01-01T13:00:00.000",
            "2024-01-01 13:00:00",
            "01/01/2024 13:00",
            "01/01/2024 13:00:00",
            "2024-01-01T13:00:00Z",
            "2024-01-01T13:00:00+10:00",
            "2024-01-01T13:00:00-05:00",
        ] {
            assert_eq!(format_timestamp(&ts(input)), expected, "input {input}");
        }
        assert_eq!(format_timestamp(&ts("2024-03-01")), "2024-03-01T00:00:00");
        assert_eq!(format_timestamp(&ts("31/12/2024")), "2024-12-31T00:00:00");
        assert!(normalize_timestamp("next tuesday").is_none());
    }

    #[test]
    fn aligns_contiguous_windows_and_flags_gaps() {
        let interval: Vec<_> = (0..6)
            .map(|h| ts(&format!("2024-01-01T0{h}:00:00")))
            .collect();

        assert_eq!(
            align(&interval, &interval[2..5]),
            Alignment::Offset {
                offset: 2,
                length: 3
            }
        );
        let gappy = vec![interval[1], interval[3]];
        assert_eq!(align(&interval, &gappy), Alignment::Divergent);
        assert_eq!(align(&interval, &[ts("2030-01-01")]), Alignment::Divergent);
    }

    #[test]
    fn alignment_serializes_with_tag() -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(&Alignment::Offset {
            offset: 24,
            length: 24,
        })?;
        assert_eq!(json, r#"{"alignment":"offset","offset":24,"length":24}"#);
        let back: Alignment = serde_json::from_str(r#"{"alignment":"divergent"}"#)?;
        assert_eq!(back, Alignment::Divergent);
        Ok(())
    }
}
