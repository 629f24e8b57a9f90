use super::*;
use crate::common::{DatasetPath, Phase, Resolution};
use crate::materialize::{MemoryPayloads, ResolutionStatus};
use crate::storage::StoreLocation;
use crate::store::{self, LoadedTable};
use crate::test_util::SolutionFixture;
use arrow::array::{Array, Float64Array};
use std::io::Cursor;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn dataset(phase: Phase, resolution: Resolution, collection: &str, property: &str) -> DatasetPath {
    DatasetPath {
        phase,
        resolution,
        collection: collection.into(),
        property: property.into(),
    }
}

fn band_values(table: &LoadedTable, row_group: usize, band: usize) -> Result<Vec<Option<f64>>, Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    for batch in table.read(Some(vec![row_group]))? {
        let column = batch
            .column_by_name(&layout::band_column(band))
            .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
            .ok_or("band column missing")?;
        out.extend((0..column.len()).map(|i| (!column.is_null(i)).then(|| column.value(i))));
    }
    Ok(out)
}

fn staging_leftovers(parent: &Path) -> Result<usize, std::io::Error> {
    Ok(std::fs::read_dir(parent)?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().contains(".staging-"))
        .count())
}

#[tokio::test]
async fn line_flow_round_trips_bit_exact_with_missing_tail() -> TestResult {
    let tmp = TempDir::new()?;
    let output = tmp.path().join("sample.plexstore");
    SolutionFixture::sample().convert(&output).await?;
    let location = StoreLocation::local(&output);

    let path = dataset(Phase::ShortTerm, Resolution::Interval, "line", "Flow");
    let table = LoadedTable::load(&location, &path.rel_path()).await?;
    assert_eq!(table.row_group_rows()?, vec![SolutionFixture::INTERVALS; 2]);

    let row = band_values(&table, 0, 1)?;
    let n = SolutionFixture::LINE_FLOW.len();
    for (got, expected) in row[..n].iter().zip(SolutionFixture::LINE_FLOW) {
        assert_eq!(got.map(f64::to_bits), Some(expected.to_bits()));
    }
    assert!(row[n..].iter().all(Option::is_none));

    // The over-long run of B2_B3 was skipped, so its row stays missing.
    assert!(band_values(&table, 1, 1)?.iter().all(Option::is_none));

    let st = store::read_axis(&location, "ST").await?;
    assert_eq!(st.first().copied(), Some(SolutionFixture::start()));
    Ok(())
}

#[tokio::test]
async fn datasets_carry_base_and_summary_units() -> TestResult {
    let tmp = TempDir::new()?;
    let output = tmp.path().join("units.plexstore");
    SolutionFixture::sample().convert(&output).await?;
    let location = StoreLocation::local(&output);

    let interval = dataset(Phase::ShortTerm, Resolution::Interval, "generator", "Generation");
    let month = dataset(Phase::ShortTerm, Resolution::Month, "generator", "Generation");
    let interval = LoadedTable::load(&location, &interval.rel_path()).await?;
    let month = LoadedTable::load(&location, &month.rel_path()).await?;

    assert_eq!(interval.schema()?.metadata()[layout::META_UNIT], "MW");
    assert_eq!(month.schema()?.metadata()[layout::META_UNIT], "GWh");
    assert_eq!(month.schema()?.metadata()[layout::META_TIMESTEPS], "1");
    Ok(())
}

#[tokio::test]
async fn report_counts_collections_datasets_and_skips() -> TestResult {
    let tmp = TempDir::new()?;
    let output = tmp.path().join("report.plexstore");
    let report = SolutionFixture::sample().convert(&output).await?;

    assert_eq!(report.format_version, layout::STORE_FORMAT_VERSION);
    assert_eq!((report.object_collections, report.relation_collections), (2, 1));
    assert_eq!(report.datasets, 5);
    assert_eq!(report.values_written, 241);
    assert_eq!(report.skipped_keys(), 2);

    let week = report
        .resolutions
        .iter()
        .find(|r| r.resolution == Resolution::Week)
        .ok_or("week report")?;
    assert_eq!(week.status, ResolutionStatus::Unsupported);

    let attrs = store::read_attributes(&StoreLocation::local(&output))
        .await?
        .ok_or("attributes written")?;
    assert_eq!(attrs.format_version, Some(layout::STORE_FORMAT_VERSION));
    assert_eq!(attrs.root_element, "SolutionDataset");
    assert_eq!(
        attrs.phases.get(&Phase::MediumTerm),
        Some(&crate::time_index::Alignment::Offset {
            offset: 24,
            length: 24
        })
    );
    assert_eq!(staging_leftovers(tmp.path())?, 0);
    Ok(())
}

#[tokio::test]
async fn reconversion_replaces_the_previous_store() -> TestResult {
    let tmp = TempDir::new()?;
    let output = tmp.path().join("again.plexstore");
    std::fs::create_dir_all(output.join("data/stale"))?;

    let first = SolutionFixture::sample().convert(&output).await?;
    let second = SolutionFixture::sample().convert(&output).await?;
    assert_eq!(first.datasets, second.datasets);
    assert!(!output.join("data/stale").exists());
    assert!(output.join(layout::ATTRS_FILE_NAME).is_file());
    Ok(())
}

#[tokio::test]
async fn truncated_payload_leaves_no_store() -> TestResult {
    let tmp = TempDir::new()?;
    let output = tmp.path().join("broken.plexstore");
    let fixture = SolutionFixture::sample();

    let mut payloads: MemoryPayloads = fixture.payloads();
    let interval = payloads
        .get(Resolution::Interval)
        .map(|b| b[..b.len() / 2].to_vec())
        .ok_or("interval payload")?;
    payloads.insert(Resolution::Interval, interval);

    let xml = fixture.metadata_xml();
    let err = convert_solution(Cursor::new(xml), Arc::new(payloads), &output, &ConvertOptions::default())
        .await
        .expect_err("truncated payload must fail");
    assert!(matches!(err, ConvertError::Materialize { .. }));
    assert!(!output.exists());
    assert_eq!(staging_leftovers(tmp.path())?, 0);
    Ok(())
}

#[tokio::test]
async fn oversized_run_length_fails_the_conversion() -> TestResult {
    let tmp = TempDir::new()?;
    let output = tmp.path().join("huge.plexstore");
    let fixture = SolutionFixture::sample();
    let xml = fixture
        .metadata_xml()
        .replacen("<length>24</length>", &format!("<length>{}</length>", 1u64 << 61), 1);

    let err = convert_solution(Cursor::new(xml), Arc::new(fixture.payloads()), &output, &ConvertOptions::default())
        .await
        .expect_err("run length overflows");
    assert!(matches!(
        err,
        ConvertError::Materialize {
            source: MaterializeError::PayloadRead {
                resolution: Resolution::Interval,
                ..
            }
        }
    ));
    assert!(!output.exists());
    Ok(())
}

#[tokio::test]
async fn malformed_metadata_leaves_no_store() -> TestResult {
    let tmp = TempDir::new()?;
    let output = tmp.path().join("bad.plexstore");
    let xml = "<SolutionDataset xmlns=\"urn:x\"><t_object><object_id>1</object_id></t_object>\
               <t_object><object_id>1</object_id></t_object></SolutionDataset>";

    let err = convert_solution(xml.as_bytes(), Arc::new(MemoryPayloads::new()), &output, &ConvertOptions::default())
        .await
        .expect_err("duplicate primary key must fail");
    assert!(matches!(err, ConvertError::Ingest { .. }));
    assert!(!output.exists());
    assert_eq!(staging_leftovers(tmp.path())?, 0);
    Ok(())
}

#[tokio::test]
async fn sequential_decode_matches_parallel() -> TestResult {
    let tmp = TempDir::new()?;
    let fixture = SolutionFixture::sample();
    let xml = fixture.metadata_xml();
    let sequential = ConvertOptions {
        parallel: false,
        ..Default::default()
    };

    let a = convert_solution(Cursor::new(xml), Arc::new(fixture.payloads()), &tmp.path().join("a"), &sequential).await?;
    let b = fixture.convert(&tmp.path().join("b")).await?;
    assert_eq!(a.resolutions, b.resolutions);
    assert_eq!(a.values_written, b.values_written);
    Ok(())
}

#[tokio::test]
async fn rejects_invalid_compression_level_before_reading() -> TestResult {
    let tmp = TempDir::new()?;
    let output = tmp.path().join("level.plexstore");
    let options = ConvertOptions {
        compression_level: 99,
        ..Default::default()
    };
    let err = convert_solution(&b"not xml"[..], Arc::new(MemoryPayloads::new()), &output, &options)
        .await
        .expect_err("level 99 is out of range");
    assert!(matches!(
        err,
        ConvertError::Write {
            source: StoreError::InvalidCompressionLevel { level: 99, .. }
        }
    ));
    assert_eq!(staging_leftovers(tmp.path())?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_conversions_on_a_multi_thread_runtime() -> TestResult {
    let tmp = TempDir::new()?;
    let fixture = SolutionFixture::sample();
    let (first, second) = (tmp.path().join("a.plexstore"), tmp.path().join("b.plexstore"));
    let (a, b) = tokio::join!(fixture.convert(&first), fixture.convert(&second));
    assert_eq!(a?.values_written, b?.values_written);
    Ok(())
}

#[tokio::test]
async fn property_names_sharing_a_file_name_are_refused() -> TestResult {
    let tmp = TempDir::new()?;
    let output = tmp.path().join("clash.plexstore");
    let mut fixture = SolutionFixture::sample();
    for (property_id, key_id, name) in [(4, 40, "Cost/MWh"), (5, 41, "Cost_MWh")] {
        fixture
            .record(
                "property",
                &[
                    ("property_id", &property_id.to_string()),
                    ("collection_id", "1"),
                    ("unit_id", "1"),
                    ("summary_unit_id", "2"),
                    ("name", name),
                ],
            )
            .record(
                "key",
                &[
                    ("key_id", &key_id.to_string()),
                    ("membership_id", "100"),
                    ("property_id", &property_id.to_string()),
                    ("phase_id", "4"),
                    ("band_id", "1"),
                ],
            )
            .run(Resolution::Interval, key_id, &[1.0, 2.0]);
    }

    let err = fixture.convert(&output).await.expect_err("file names collide");
    match err {
        ConvertError::PathCollision { first, second, .. } => {
            assert!(first.ends_with("Cost/MWh"), "first: {first}");
            assert!(second.ends_with("Cost_MWh"), "second: {second}");
        }
        other => return Err(format!("unexpected error: {other}").into()),
    }
    assert!(!output.exists());
    assert_eq!(staging_leftovers(tmp.path())?, 0);
    Ok(())
}
