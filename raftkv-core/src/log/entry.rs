//! Log entries and their on-disk record framing.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An opaque state-machine command.
    Data,
    /// A membership change; the payload is an encoded `Configuration`.
    Configuration,
}

/// Single replicated log entry, identified by (term, index).
///
/// Two entries with the same (index, term) on any two nodes carry identical
/// data and identical prefixes (log matching).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Strictly monotonic, starting at 1.
    pub index: u64,
    /// Term the entry was created in.
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, kind: EntryKind, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind,
            data,
        }
    }

    /// Serialize as a length-prefixed record: `<u32 len><bincode entry>`.
    pub fn to_record(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut record = Vec::with_capacity(4 + body.len());
        record.extend_from_slice(&(body.len() as u32).to_be_bytes());
        record.extend_from_slice(&body);
        Ok(record)
    }

    /// Read one length-prefixed record.
    ///
    /// Returns `Ok(None)` on a clean end of stream, an error on a torn or
    /// undecodable record. `file` and `offset` only label the error.
    pub fn read_record<R: Read>(
        reader: &mut R,
        file: &str,
        offset: u64,
    ) -> Result<Option<(Self, u64)>> {
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(reader, &mut len_buf)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial => {
                return Err(Error::CorruptRecord {
                    file: file.to_string(),
                    offset,
                })
            }
            ReadOutcome::Full => {}
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        match read_exact_or_eof(reader, &mut body)? {
            ReadOutcome::Full => {}
            _ => {
                return Err(Error::CorruptRecord {
                    file: file.to_string(),
                    offset,
                })
            }
        }

        let entry: LogEntry = bincode::deserialize(&body).map_err(|_| Error::CorruptRecord {
            file: file.to_string(),
            offset,
        })?;
        Ok(Some((entry, 4 + len as u64)))
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}
