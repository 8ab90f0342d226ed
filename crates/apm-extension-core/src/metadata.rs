//! Metadata capture from agent intake payloads.
//!
//! The first line of an intake payload is a JSON object whose top-level key
//! is `metadata`. The first such line seen by the process is cached for the
//! lifetime of the container and prepended to every synthesized document.

use std::io::{BufRead, BufReader, Read};
use std::sync::OnceLock;

use bytes::Bytes;

use crate::transport::{AgentData, ContentEncoding};

/// Process-lifetime cache of the agent's metadata line.
///
/// Write-once: the first successful capture wins and later writes are
/// ignored, so concurrent captures are idempotent.
#[derive(Debug, Default)]
pub struct MetadataCache {
    cell: OnceLock<Bytes>,
}

impl MetadataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a metadata line has been captured yet.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }

    /// The captured metadata line, if any. Cheap to clone.
    #[must_use]
    pub fn get(&self) -> Option<Bytes> {
        self.cell.get().cloned()
    }

    /// Store a metadata line unless one was already captured. Returns whether
    /// this call was the winning write.
    pub fn set(&self, line: Bytes) -> bool {
        self.cell.set(line).is_ok()
    }
}

/// Extract the metadata line from an agent payload, decoding only as much of
/// the body as is needed to read the first line.
///
/// Returns `Ok(None)` when the payload decodes fine but its first line is not
/// a metadata line. Decoding failures bubble up so the caller can drop the
/// payload and count it.
pub fn extract_metadata_line(data: &AgentData) -> std::io::Result<Option<Bytes>> {
    let mut first_line = String::new();
    match data.content_encoding {
        Some(ContentEncoding::Gzip) => {
            let mut reader = BufReader::new(flate2::read::GzDecoder::new(&data.data[..]));
            reader.read_line(&mut first_line)?;
        }
        Some(ContentEncoding::Deflate) => {
            let mut reader = BufReader::new(flate2::read::ZlibDecoder::new(&data.data[..]));
            reader.read_line(&mut first_line)?;
        }
        None => {
            let mut reader = BufReader::new(&data.data[..]);
            reader.read_line(&mut first_line)?;
        }
    }

    let line = first_line.trim_end_matches('\n');
    if line.to_lowercase().contains("metadata") {
        Ok(Some(Bytes::copy_from_slice(line.as_bytes())))
    } else {
        Ok(None)
    }
}

/// Decode a payload body according to its content encoding.
pub fn uncompress(raw: &[u8], encoding: Option<ContentEncoding>) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match encoding {
        Some(ContentEncoding::Gzip) => {
            flate2::read::GzDecoder::new(raw).read_to_end(&mut out)?;
        }
        Some(ContentEncoding::Deflate) => {
            flate2::read::ZlibDecoder::new(raw).read_to_end(&mut out)?;
        }
        None => out.extend_from_slice(raw),
    }
    Ok(out)
}
