//! Archive record retrieval.
//!
//! An ARC v1 record starts with a single header line whose last field is the
//! length of the body that follows it:
//!
//! ```text
//! <url> <ip> <date> <content-type> <length>\n
//! <length bytes of body>
//! ```
//!
//! Small bodies are buffered in memory. Bodies above the configured threshold
//! are staged to a transient file and handed out through a single-use
//! [`RemoteFile`].

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use arcvault_batch::RemoteFile;
use bytes::Bytes;

use crate::{BitarchiveError, Result};

/// Longest header line accepted before the record is considered invalid.
const MAX_HEADER_LEN: u64 = 8 * 1024;

/// Where a record body lives once retrieved.
#[derive(Debug)]
pub enum RecordPayload {
    InMemory(Bytes),
    Remote(RemoteFile),
}

/// A retrieved archive record.
#[derive(Debug)]
pub struct ArchiveRecordHandle {
    source_file: String,
    offset: u64,
    length: u64,
    header: String,
    payload: RecordPayload,
}

impl ArchiveRecordHandle {
    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Body length in bytes, excluding the header line.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// The record's header line, without the trailing newline.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// The URL the record was captured from.
    pub fn url(&self) -> &str {
        self.header.split(' ').next().unwrap_or_default()
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.payload, RecordPayload::Remote(_))
    }

    /// Writes the body into `out`.
    ///
    /// In-memory bodies can be read any number of times. A remote body can be
    /// read once; the read deletes the transient file and any later read fails
    /// with [`BitarchiveError::IllegalState`].
    pub fn read_into(&self, out: &mut dyn Write) -> Result<u64> {
        match &self.payload {
            RecordPayload::InMemory(body) => {
                out.write_all(body)?;
                Ok(body.len() as u64)
            }
            RecordPayload::Remote(remote) => Ok(remote.append_to(out)?),
        }
    }

    /// Returns the whole body. Same single-use rule as [`Self::read_into`].
    pub fn read(&self) -> Result<Bytes> {
        match &self.payload {
            RecordPayload::InMemory(body) => Ok(body.clone()),
            RecordPayload::Remote(remote) => Ok(Bytes::from(remote.read_all()?)),
        }
    }
}

/// Reads the record starting at `offset` of `path`.
pub(crate) fn read_record(
    path: &Path,
    filename: &str,
    offset: u64,
    memory_threshold: u64,
    staging_dir: &Path,
) -> Result<ArchiveRecordHandle> {
    let invalid = |reason: String| BitarchiveError::InvalidRecord {
        filename: filename.to_string(),
        offset,
        reason,
    };

    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if offset >= size {
        return Err(BitarchiveError::InvalidArgument(format!(
            "offset {offset} is beyond the end of '{filename}' ({size} bytes)"
        )));
    }
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::new(file);

    let mut raw = Vec::new();
    (&mut reader).take(MAX_HEADER_LEN).read_until(b'\n', &mut raw)?;
    if raw.last() != Some(&b'\n') {
        return Err(invalid("header line is missing or too long".to_string()));
    }
    raw.pop();
    let header = String::from_utf8(raw).map_err(|_| invalid("header is not UTF-8".to_string()))?;
    let length: u64 = header
        .rsplit(' ')
        .next()
        .and_then(|field| field.trim().parse().ok())
        .ok_or_else(|| invalid(format!("header has no length field: '{header}'")))?;

    let body_start = offset + header.len() as u64 + 1;
    if body_start.saturating_add(length) > size {
        return Err(invalid(format!(
            "body of {length} bytes runs past the end of the file"
        )));
    }

    let mut body = reader.take(length);
    let payload = if length <= memory_threshold {
        let mut buf = Vec::with_capacity(length as usize);
        body.read_to_end(&mut buf)?;
        RecordPayload::InMemory(Bytes::from(buf))
    } else {
        let name = format!("{filename}-{offset}");
        RecordPayload::Remote(RemoteFile::stage(staging_dir, name, &mut body)?)
    };

    tracing::info!(filename, offset, length, remote = matches!(payload, RecordPayload::Remote(_)), "retrieved record");
    Ok(ArchiveRecordHandle {
        source_file: filename.to_string(),
        offset,
        length,
        header,
        payload,
    })
}
