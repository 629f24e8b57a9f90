//! Test helpers: a small solution that exercises every conversion path.
//!
//! [`SolutionFixture::sample`] describes two generators, two fuels and two
//! lines over a 48-hour interval axis, with a short-term and a medium-term
//! phase. Its payloads include an orphan key, an over-long run and an
//! unsupported weekly payload, so decoding reports skips while the
//! remaining keys still land on their own values.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::common::Resolution;
use crate::materialize::MemoryPayloads;
use crate::pipeline::{ConversionReport, ConvertError, ConvertOptions, convert_solution};
use crate::time_index::format_timestamp;

/// Root element of fixture metadata.
pub const ROOT_ELEMENT: &str = "SolutionDataset";

/// Namespace of fixture metadata.
pub const NAMESPACE: &str = "http://tempuri.org/SolutionDataset.xsd";

#[derive(Debug, Clone)]
struct Record {
    table: String,
    fields: Vec<(String, String)>,
}

/// Builder for metadata XML and matching payloads.
#[derive(Debug, Clone, Default)]
pub struct SolutionFixture {
    records: Vec<Record>,
    payloads: BTreeMap<Resolution, Vec<f64>>,
}

impl SolutionFixture {
    /// Interval timesteps of the sample.
    pub const INTERVALS: usize = 48;

    /// Short-term flow of line `B1_B2`, hours 0 to 23.
    pub const LINE_FLOW: [f64; 24] = [
        -0.935319116500001,
        -0.6970154267499986,
        -0.5217735017499989,
        -0.41615258650000153,
        -0.3980630747500005,
        -0.46516376499999984,
        -0.7597340485000006,
        -1.2800584555000007,
        -1.812169899250002,
        -2.0393797997500016,
        -2.1432084820000004,
        -2.20546277575,
        -2.2587450190000005,
        -2.15386336825,
        -2.0509797174999984,
        -1.98446034625,
        -1.9687104047500001,
        -2.1013393862500007,
        -2.4032077540000008,
        -2.3716624119999983,
        -2.0844381467499993,
        -1.7796791724999996,
        -1.4374390120000011,
        -1.1613561009999995,
    ];

    /// Flow of line `B1_B2` (short term).
    pub const KEY_LINE_FLOW: i64 = 3;
    /// Flow of line `B2_B3`, listed with one value more than the axis holds.
    pub const KEY_LONG_FLOW: i64 = 4;
    /// Offtake of `101_CT_1` from `Coal`, band 2.
    pub const KEY_COAL_OFFTAKE: i64 = 6;
    /// Generation of `107_CC_1` (short term).
    pub const KEY_CC_GENERATION: i64 = 2;
    /// Generation of `107_CC_1` (medium term).
    pub const KEY_CC_GENERATION_MT: i64 = 8;
    /// Key whose membership does not exist.
    pub const KEY_ORPHAN: i64 = 7;

    /// Empty fixture: no records, no payloads.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard sample solution.
    pub fn sample() -> Self {
        let mut f = Self::new();

        for (id, name) in [(1, "System"), (2, "Generator"), (3, "Fuel"), (4, "Line")] {
            f.record("class", &[("class_id", &id.to_string()), ("name", name)]);
        }
        for (id, class, name) in [(1, 2, "Coal"), (2, 2, "Gas Turbine"), (3, 4, "AC"), (4, 3, "Fuels")] {
            f.record(
                "category",
                &[
                    ("category_id", &id.to_string()),
                    ("class_id", &class.to_string()),
                    ("name", name),
                ],
            );
        }
        for (id, class, category, name) in [
            (1, 1, None, "System"),
            (10, 2, Some(1), "101_CT_1"),
            (11, 2, Some(2), "107_CC_1"),
            (20, 3, Some(4), "Coal"),
            (21, 3, Some(4), "Gas"),
            (30, 4, Some(3), "B1_B2"),
            (31, 4, None, "B2_B3"),
        ] {
            let category = category.map(|c: i64| c.to_string()).unwrap_or_default();
            f.record(
                "object",
                &[
                    ("object_id", &id.to_string()),
                    ("class_id", &class.to_string()),
                    ("name", name),
                    ("category_id", &category),
                ],
            );
        }
        for (id, parent, child, name) in [(1, 1, 2, "Generators"), (2, 2, 3, "Fuels"), (3, 1, 4, "Lines")] {
            f.record(
                "collection",
                &[
                    ("collection_id", &id.to_string()),
                    ("parent_class_id", &parent.to_string()),
                    ("child_class_id", &child.to_string()),
                    ("name", name),
                ],
            );
        }
        for (id, collection, parent_class, child_class, parent, child) in [
            (100, 1, 1, 2, 1, 10),
            (101, 1, 1, 2, 1, 11),
            (102, 2, 2, 3, 10, 20),
            (103, 2, 2, 3, 11, 21),
            (104, 3, 1, 4, 1, 30),
            (105, 3, 1, 4, 1, 31),
        ] {
            f.record(
                "membership",
                &[
                    ("membership_id", &id.to_string()),
                    ("collection_id", &collection.to_string()),
                    ("parent_class_id", &parent_class.to_string()),
                    ("child_class_id", &child_class.to_string()),
                    ("parent_object_id", &parent.to_string()),
                    ("child_object_id", &child.to_string()),
                ],
            );
        }
        for (id, value) in [(1, "MW"), (2, "GWh"), (3, "GJ"), (4, "TJ")] {
            f.record("unit", &[("unit_id", &id.to_string()), ("value", value)]);
        }
        for (id, collection, unit, summary, name) in [
            (1, 1, 1, 2, "Generation"),
            (2, 2, 3, 4, "Offtake"),
            (3, 3, 1, 2, "Flow"),
        ] {
            f.record(
                "property",
                &[
                    ("property_id", &id.to_string()),
                    ("collection_id", &collection.to_string()),
                    ("unit_id", &unit.to_string()),
                    ("summary_unit_id", &summary.to_string()),
                    ("name", name),
                ],
            );
        }
        for (id, membership, property, phase, band) in [
            (1, 100, 1, 4, 1),
            (Self::KEY_CC_GENERATION, 101, 1, 4, 1),
            (Self::KEY_LINE_FLOW, 104, 3, 4, 1),
            (Self::KEY_LONG_FLOW, 105, 3, 4, 1),
            (5, 103, 2, 4, 1),
            (Self::KEY_COAL_OFFTAKE, 102, 2, 4, 2),
            (Self::KEY_ORPHAN, 999, 1, 4, 1),
            (Self::KEY_CC_GENERATION_MT, 101, 1, 3, 1),
        ] {
            f.record(
                "key",
                &[
                    ("key_id", &id.to_string()),
                    ("membership_id", &membership.to_string()),
                    ("property_id", &property.to_string()),
                    ("phase_id", &phase.to_string()),
                    ("band_id", &band.to_string()),
                ],
            );
        }

        let start = Self::start();
        for i in 0..Self::INTERVALS {
            let ts = start + Duration::hours(i as i64);
            f.record(
                "period_0",
                &[("interval_id", &(i + 1).to_string()), ("datetime", &format_timestamp(&ts))],
            );
            f.record(
                "phase_4",
                &[("interval_id", &(i + 1).to_string()), ("period_id", &(i + 1).to_string())],
            );
        }
        // Medium term covers the second day only.
        for i in 24..Self::INTERVALS {
            f.record(
                "phase_3",
                &[("interval_id", &(i + 1).to_string()), ("period_id", &(i - 23).to_string())],
            );
        }
        f.record("period_2", &[("week_id", "1"), ("week_ending", "2024-01-07")]);
        f.record("period_3", &[("month_id", "1"), ("month_beginning", "01/01/2024")]);

        let ct_generation: Vec<f64> = (0..Self::INTERVALS).map(|t| 40.0 + t as f64).collect();
        let offtake: Vec<f64> = (0..Self::INTERVALS).map(|t| 9.5 + t as f64 / 4.0).collect();
        f.run(Resolution::Interval, Self::KEY_LINE_FLOW, &Self::LINE_FLOW);
        f.run(Resolution::Interval, 1, &ct_generation);
        f.run(Resolution::Interval, Self::KEY_ORPHAN, &[1.0, 2.0, 3.0, 4.0, 5.0]);
        f.run(Resolution::Interval, Self::KEY_LONG_FLOW, &vec![0.5; Self::INTERVALS + 2]);
        f.run(Resolution::Interval, 5, &offtake);
        f.run(Resolution::Interval, Self::KEY_COAL_OFFTAKE, &offtake);
        f.run(Resolution::Interval, Self::KEY_CC_GENERATION, &Self::cc_generation());
        f.run(
            Resolution::Interval,
            Self::KEY_CC_GENERATION_MT,
            &Self::cc_generation()[24..],
        );
        f.run(Resolution::Month, Self::KEY_CC_GENERATION, &[11.25]);
        f.run(Resolution::Week, Self::KEY_CC_GENERATION, &[3.0]);
        f
    }

    /// First interval timestamp of the sample.
    pub fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default()
    }

    /// Short-term interval generation of `107_CC_1`.
    pub fn cc_generation() -> Vec<f64> {
        let mut values: Vec<f64> = (0..24).map(|t| 100.0 + t as f64).collect();
        values.extend([170.0; 12]);
        values.extend([
            231.7, 293.3, 293.3, 293.3, 335.423429, 355.0, 355.0, 355.0, 294.542643, 293.3, 231.7, 231.7,
        ]);
        values
    }

    /// Append one metadata record. Empty values become empty elements.
    pub fn record(&mut self, table: &str, fields: &[(&str, &str)]) -> &mut Self {
        self.records.push(Record {
            table: table.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        self
    }

    /// Append a run for `key_id` to the payload of `resolution` and list it
    /// in `key_index`.
    pub fn run(&mut self, resolution: Resolution, key_id: i64, values: &[f64]) -> &mut Self {
        let payload = self.payloads.entry(resolution).or_default();
        let position = payload.len() * 8;
        payload.extend_from_slice(values);
        self.record(
            "key_index",
            &[
                ("key_id", &key_id.to_string()),
                ("period_type_id", &resolution.code().to_string()),
                ("position", &position.to_string()),
                ("length", &values.len().to_string()),
            ],
        )
    }

    /// Metadata document.
    pub fn metadata_xml(&self) -> String {
        let mut xml = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<{ROOT_ELEMENT} xmlns=\"{NAMESPACE}\">\n"
        );
        for record in &self.records {
            xml.push_str(&format!("  <t_{}>", record.table));
            for (name, value) in &record.fields {
                if value.is_empty() {
                    xml.push_str(&format!("<{name} />"));
                } else {
                    xml.push_str(&format!("<{name}>{}</{name}>", quick_xml::escape::escape(value.as_str())));
                }
            }
            xml.push_str(&format!("</t_{}>\n", record.table));
        }
        xml.push_str(&format!("</{ROOT_ELEMENT}>\n"));
        xml
    }

    /// Payload values per resolution.
    pub fn payload_values(&self, resolution: Resolution) -> Option<&[f64]> {
        self.payloads.get(&resolution).map(Vec::as_slice)
    }

    /// Payloads, little-endian encoded.
    pub fn payloads(&self) -> MemoryPayloads {
        let mut payloads = MemoryPayloads::new();
        for (resolution, values) in &self.payloads {
            payloads.insert_values(*resolution, values);
        }
        payloads
    }

    /// Convert this solution into a store at `output` with default options.
    pub async fn convert(&self, output: &Path) -> Result<ConversionReport, ConvertError> {
        let xml = std::io::Cursor::new(self.metadata_xml());
        convert_solution(xml, Arc::new(self.payloads()), output, &ConvertOptions::default()).await
    }
}
