use std::collections::BTreeMap;
use std::io::{self, Read};

use crate::common::Resolution;

use super::{MaterializeError, MaterializeResult, MissingPayloadSnafu, ResolutionReport};

/// Callback that decodes one payload stream.
pub type PayloadReader<'a> =
    dyn FnMut(&mut dyn Read) -> MaterializeResult<ResolutionReport> + 'a;

/// Provider of raw payload streams, one per resolution.
///
/// Streams are handed to a callback rather than returned, so sources whose
/// readers borrow a container (an open archive, a memory map) can still be
/// shared across the decode threads.
pub trait PayloadSource: Send + Sync {
    /// Resolutions with a payload.
    fn resolutions(&self) -> Vec<Resolution>;

    /// Open the payload of `resolution` and pass it to `read`.
    fn with_payload(
        &self,
        resolution: Resolution,
        read: &mut PayloadReader<'_>,
    ) -> MaterializeResult<ResolutionReport>;
}

/// Payloads held in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryPayloads {
    payloads: BTreeMap<Resolution, Vec<u8>>,
}

impl MemoryPayloads {
    /// No payloads.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the raw bytes of one resolution.
    pub fn insert(&mut self, resolution: Resolution, bytes: Vec<u8>) -> &mut Self {
        self.payloads.insert(resolution, bytes);
        self
    }

    /// Set one resolution from values, encoded little-endian.
    pub fn insert_values(&mut self, resolution: Resolution, values: &[f64]) -> &mut Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.insert(resolution, bytes)
    }

    /// Raw bytes of one resolution.
    pub fn get(&self, resolution: Resolution) -> Option<&[u8]> {
        self.payloads.get(&resolution).map(Vec::as_slice)
    }
}

impl PayloadSource for MemoryPayloads {
    fn resolutions(&self) -> Vec<Resolution> {
        self.payloads.keys().copied().collect()
    }

    fn with_payload(
        &self,
        resolution: Resolution,
        read: &mut PayloadReader<'_>,
    ) -> Result<ResolutionReport, MaterializeError> {
        let Some(bytes) = self.payloads.get(&resolution) else {
            return MissingPayloadSnafu { resolution }.fail();
        };
        let mut reader = io::Cursor::new(bytes.as_slice());
        read(&mut reader)
    }
}
