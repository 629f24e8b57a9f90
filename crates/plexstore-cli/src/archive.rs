//! Solution archive discovery.
//!
//! A solution archive is a zip holding one `Model*xml` metadata member, one
//! `t_data_<n>.BIN` payload per resolution and a `Model*Log*.txt` run log.
//! Members are matched on their file name, wherever they sit in the archive.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use plexstore_core::Resolution;
use plexstore_core::materialize::{
    MaterializeError, MaterializeResult, PayloadReader, PayloadSource, ResolutionReport,
};
use snafu::prelude::*;
use tracing::debug;
use zip::ZipArchive;

use crate::error::{
    ArchiveMissingSnafu, ArchiveUnreadableSnafu, CliResult, MemberAmbiguousSnafu,
    MemberMissingSnafu, MemberReadSnafu, MemberUnreadableSnafu,
};

/// Extension given to stores written next to their archive.
pub const STORE_EXTENSION: &str = "plexstore";

/// What a member name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// The `Model*xml` metadata description.
    Metadata,
    /// The `Model*Log*.txt` run log.
    Log,
    /// A `t_data_<n>.BIN` payload of one resolution.
    Payload(Resolution),
}

/// Classify one member by its file name.
pub fn classify_member(name: &str) -> Option<MemberKind> {
    let file = name.rsplit(['/', '\\']).next().unwrap_or(name);
    if let Some(code) = file
        .strip_prefix("t_data_")
        .and_then(|rest| rest.strip_suffix(".BIN"))
    {
        return code
            .parse::<i64>()
            .ok()
            .and_then(Resolution::from_code)
            .map(MemberKind::Payload);
    }
    let rest = file.strip_prefix("Model")?;
    if rest
        .find("Log")
        .is_some_and(|at| rest[at + 3..].len() > 3 && rest.ends_with("txt"))
    {
        return Some(MemberKind::Log);
    }
    rest.ends_with("xml").then_some(MemberKind::Metadata)
}

/// Default store path for an archive: the archive path with its extension
/// replaced.
pub fn default_output(archive: &Path) -> PathBuf {
    archive.with_extension(STORE_EXTENSION)
}

/// Located members of one archive.
#[derive(Debug, Clone)]
pub struct SolutionArchive {
    path: PathBuf,
    metadata: String,
    log: String,
    payloads: BTreeMap<Resolution, String>,
}

impl SolutionArchive {
    /// Scan `path` and locate its members.
    pub fn open(path: &Path) -> CliResult<Self> {
        let archive = open_zip(path)?;
        let display = path.display().to_string();

        let mut metadata: Option<String> = None;
        let mut log: Option<String> = None;
        let mut payloads = BTreeMap::new();
        for name in archive.file_names() {
            match classify_member(name) {
                Some(MemberKind::Metadata) => set_once(&mut metadata, name, &display, "metadata")?,
                Some(MemberKind::Log) => set_once(&mut log, name, &display, "log")?,
                Some(MemberKind::Payload(resolution)) => {
                    if let Some(first) = payloads.insert(resolution, name.to_string()) {
                        return MemberAmbiguousSnafu {
                            path: display,
                            what: "payload",
                            first,
                            second: name,
                        }
                        .fail();
                    }
                }
                None => debug!(member = name, "ignoring archive member"),
            }
        }

        let metadata = metadata.context(MemberMissingSnafu {
            path: display.as_str(),
            what: "metadata",
        })?;
        let log = log.context(MemberMissingSnafu {
            path: display.as_str(),
            what: "log",
        })?;
        ensure!(
            !payloads.is_empty(),
            MemberMissingSnafu {
                path: display,
                what: "payload",
            }
        );

        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            log,
            payloads,
        })
    }

    /// Archive path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the metadata member.
    pub fn metadata_member(&self) -> &str {
        &self.metadata
    }

    /// Name of the log member.
    pub fn log_member(&self) -> &str {
        &self.log
    }

    /// Payload streams, opened on demand.
    pub fn payloads(&self) -> ZipPayloads {
        ZipPayloads {
            path: self.path.clone(),
            members: self.payloads.clone(),
        }
    }

    /// Contents of the metadata member, read into memory.
    pub fn read_metadata(&self) -> CliResult<Vec<u8>> {
        let mut archive = open_zip(&self.path)?;
        let mut member = archive.by_name(&self.metadata).context(MemberUnreadableSnafu {
            path: self.path.display().to_string(),
            member: self.metadata.as_str(),
        })?;
        let mut bytes = Vec::new();
        member.read_to_end(&mut bytes).context(MemberReadSnafu {
            path: self.path.display().to_string(),
            member: self.metadata.as_str(),
        })?;
        debug!(member = %self.metadata, bytes = bytes.len(), "metadata read");
        Ok(bytes)
    }
}

fn set_once(slot: &mut Option<String>, name: &str, path: &str, what: &'static str) -> CliResult<()> {
    if let Some(first) = slot.as_ref() {
        return MemberAmbiguousSnafu {
            path,
            what,
            first: first.as_str(),
            second: name,
        }
        .fail();
    }
    *slot = Some(name.to_string());
    Ok(())
}

fn open_zip(path: &Path) -> CliResult<ZipArchive<BufReader<File>>> {
    let display = path.display().to_string();
    let file = File::open(path).context(ArchiveMissingSnafu {
        path: display.as_str(),
    })?;
    ZipArchive::new(BufReader::new(file)).context(ArchiveUnreadableSnafu { path: display })
}

/// Payload members of one archive. Each decode opens its own handle, so
/// resolutions can be read concurrently.
#[derive(Debug, Clone)]
pub struct ZipPayloads {
    path: PathBuf,
    members: BTreeMap<Resolution, String>,
}

impl PayloadSource for ZipPayloads {
    fn resolutions(&self) -> Vec<Resolution> {
        self.members.keys().copied().collect()
    }

    fn with_payload(
        &self,
        resolution: Resolution,
        read: &mut PayloadReader<'_>,
    ) -> MaterializeResult<ResolutionReport> {
        let Some(name) = self.members.get(&resolution) else {
            return Err(MaterializeError::MissingPayload { resolution });
        };
        let file = File::open(&self.path).map_err(|e| MaterializeError::OpenPayload {
            resolution,
            source: Box::new(e),
        })?;
        let mut archive =
            ZipArchive::new(BufReader::new(file)).map_err(|e| MaterializeError::OpenPayload {
                resolution,
                source: Box::new(e),
            })?;
        let mut member = archive
            .by_name(name)
            .map_err(|e| MaterializeError::OpenPayload {
                resolution,
                source: Box::new(e),
            })?;
        read(&mut member)
    }
}
