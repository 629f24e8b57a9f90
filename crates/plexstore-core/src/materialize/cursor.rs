use std::io::{self, Read};

const CHUNK_BYTES: usize = 64 * 1024;
const VALUE_BYTES: usize = std::mem::size_of::<f64>();

/// Forward-only reader of little-endian `f64` runs.
///
/// The cursor only ever advances by whole runs, in stream order. It never
/// seeks, so the stream's physical layout is the only source of positions.
#[derive(Debug)]
pub struct RunCursor<R: Read> {
    reader: R,
    consumed: u64,
    chunk: Vec<u8>,
}

impl<R: Read> RunCursor<R> {
    /// Wrap a payload stream positioned at its first value.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            consumed: 0,
            chunk: vec![0u8; CHUNK_BYTES],
        }
    }

    /// Read the next `len` values into `out`, replacing its contents.
    ///
    /// A stream that ends inside the run fails with
    /// [`io::ErrorKind::UnexpectedEof`]; a `len` whose byte size overflows
    /// fails with [`io::ErrorKind::InvalidData`].
    pub fn read_run(&mut self, len: usize, out: &mut Vec<f64>) -> io::Result<()> {
        out.clear();
        let mut remaining = len.checked_mul(VALUE_BYTES).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("run of {len} values exceeds addressable size"),
            )
        })?;
        // Grows with the bytes actually read.
        out.reserve(len.min(CHUNK_BYTES / VALUE_BYTES));
        while remaining > 0 {
            let take = remaining.min(self.chunk.len());
            let buf = &mut self.chunk[..take];
            self.reader.read_exact(buf)?;
            out.extend(buf.chunks_exact(VALUE_BYTES).map(|b| {
                let mut raw = [0u8; VALUE_BYTES];
                raw.copy_from_slice(b);
                f64::from_le_bytes(raw)
            }));
            remaining -= take;
            self.consumed += take as u64;
        }
        Ok(())
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn reads_consecutive_runs_bit_exact() -> io::Result<()> {
        let values = [-0.935319116500001, f64::MIN_POSITIVE, 1e300, -0.0, 42.5];
        let mut cursor = RunCursor::new(io::Cursor::new(encode(&values)));
        let mut run = Vec::new();

        cursor.read_run(2, &mut run)?;
        assert_eq!(run, values[..2]);
        cursor.read_run(0, &mut run)?;
        assert!(run.is_empty());
        cursor.read_run(3, &mut run)?;
        assert_eq!(
            run.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            values[2..].iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
        assert_eq!(cursor.consumed(), 40);
        Ok(())
    }

    #[test]
    fn spans_chunk_boundaries() -> io::Result<()> {
        let values: Vec<f64> = (0..20_000).map(|i| i as f64 * 0.5).collect();
        let mut cursor = RunCursor::new(io::Cursor::new(encode(&values)));
        let mut run = Vec::new();
        cursor.read_run(values.len(), &mut run)?;
        assert_eq!(run, values);
        Ok(())
    }

    #[test]
    fn short_stream_is_an_error() {
        let mut cursor = RunCursor::new(io::Cursor::new(encode(&[1.0, 2.0])));
        let mut run = Vec::new();
        let err = cursor.read_run(3, &mut run).expect_err("stream is too short");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_length_is_an_error_not_a_panic() {
        let mut cursor = RunCursor::new(io::Cursor::new(encode(&[1.0, 2.0])));
        let mut run = Vec::new();

        let err = cursor
            .read_run(1usize << 61, &mut run)
            .expect_err("byte size overflows");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(cursor.consumed(), 0);

        // Representable but far beyond the stream: no up-front allocation.
        let err = cursor
            .read_run(usize::MAX / VALUE_BYTES, &mut run)
            .expect_err("stream is too short");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
