use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use plexstore_core::Resolution;
use plexstore_core::test_util::SolutionFixture;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub const METADATA_MEMBER: &str = "Model Base Solution.xml";
pub const LOG_MEMBER: &str = "Model Base Log.txt";

/// Which members to leave out of a written archive.
#[derive(Debug, Default, Clone, Copy)]
pub struct Omit {
    pub log: bool,
    pub metadata: bool,
}

pub fn archive_path(tmp: &TempDir, name: &str) -> PathBuf {
    tmp.path().join(format!("{name}.zip"))
}

/// Write the sample solution as a zip archive at `path`.
pub fn write_sample_archive(path: &Path, omit: Omit) -> TestResult {
    let fixture = SolutionFixture::sample();
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zip = ZipWriter::new(File::create(path)?);

    if !omit.metadata {
        zip.start_file(METADATA_MEMBER, options)?;
        zip.write_all(fixture.metadata_xml().as_bytes())?;
    }
    for resolution in Resolution::ALL {
        let Some(values) = fixture.payload_values(resolution) else {
            continue;
        };
        zip.start_file(format!("t_data_{}.BIN", resolution.code()), options)?;
        for value in values {
            zip.write_all(&value.to_le_bytes())?;
        }
    }
    if !omit.log {
        zip.start_file(LOG_MEMBER, options)?;
        zip.write_all(b"Completed in 0.2 seconds\n")?;
    }
    zip.finish()?;
    Ok(())
}
