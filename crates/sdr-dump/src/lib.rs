//! Dump-line consumption: chunked line assembly and `SET site:` payload parsing.

use sdr_core::{has_text, SiteRecord};
use thiserror::Error;

pub const CRATE_NAME: &str = "sdr-dump";

/// Only lines carrying this prefix are actionable. Everything else in the
/// dump (other key namespaces, banners, blank lines) is skipped without
/// comment.
pub const SITE_LINE_PREFIX: &str = "SET     site:";

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("no JSON payload column in dump line")]
    MissingPayload,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("no site ID")]
    MissingId,
}

/// Reassembles newline-delimited lines from arbitrarily sliced byte chunks.
///
/// One partial line is buffered across `push` calls; `finish` flushes it as
/// the final line of the stream, even when it is empty.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every line the chunk completed, in stream
    /// order. Lines are decoded per line, so multi-byte characters sliced at
    /// a chunk boundary are whole again before decoding.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// End of stream: whatever is still buffered is the last line.
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

/// Parse one raw dump line.
///
/// `Ok(None)` means the line does not match the site SET format; that is a
/// silent skip, not an error. A matching line whose payload cannot be turned
/// into a site record with an id is a `DumpError`.
pub fn parse_dump_line(line: &str) -> Result<Option<SiteRecord>, DumpError> {
    if !line.starts_with(SITE_LINE_PREFIX) {
        return Ok(None);
    }
    let payload = extract_payload(line).ok_or(DumpError::MissingPayload)?;
    let site: SiteRecord = serde_json::from_str(payload)?;
    if !has_text(Some(&site.id)) {
        return Err(DumpError::MissingId);
    }
    Ok(Some(site))
}

/// The payload is the single-quoted column at the end of the line: the text
/// after the first quote, minus the line's final character (the closing
/// quote).
fn extract_payload(line: &str) -> Option<&str> {
    let open = line.find('\'')?;
    let mut payload = line[open + 1..].chars();
    payload.next_back();
    Some(payload.as_str())
}
