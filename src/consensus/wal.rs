//! Write-ahead log.
//!
//! Frame layout: `len: u32 BE | checksum: 4 bytes (blake3 prefix of payload) | payload (bincode)`.
//!
//! On open, a torn final frame (short header, short payload, or bad checksum on the very last
//! frame) is truncated away: it is the write that was in flight when the process died. Any bad
//! frame before the tail is corruption and fails the open.

use crate::consensus::timeout::TimeoutInfo;
use crate::consensus::types::{Height, Proposal, Round, Step, Vote};
use bytes::{BufMut, BytesMut};
use serde::{Serialize, Deserialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const HEADER_LEN: usize = 8;
const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEvent {
    /// Round 0 of height `h` began without a logged timeout: at startup, or straight after a
    /// commit when the commit timeout is skipped.
    Start(Height),
    Proposal(Proposal),
    Vote(Vote),
    Timeout(TimeoutInfo),
    TxsAvailable { height: Height, round: Round },
    /// Height `h` was committed and applied. Written after the application accepted the block.
    EndHeight(Height),
}

/// One logged event, tagged with the state it was received in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub event: WalEvent,
}

impl WalEntry {
    /// Height the event belongs to, as opposed to the height the node was at.
    pub fn event_height(&self) -> Height {
        match &self.event {
            WalEvent::Start(h) => *h,
            WalEvent::Proposal(p) => p.height,
            WalEvent::Vote(v) => v.height,
            WalEvent::Timeout(t) => t.height,
            WalEvent::TxsAvailable { height, .. } => *height,
            WalEvent::EndHeight(h) => *h,
        }
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal encoding: {0}")]
    Encode(#[from] bincode::Error),
    #[error("corrupted wal frame at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },
    #[error("wal frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = blake3::hash(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.as_bytes()[..4]);
    out
}

fn encode_frame(entry: &WalEntry) -> Result<BytesMut, WalError> {
    let payload = bincode::serialize(entry)?;
    if payload.len() > MAX_FRAME {
        return Err(WalError::FrameTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&checksum(&payload));
    buf.put_slice(&payload);
    Ok(buf)
}

/// Result of scanning a log image.
#[derive(Debug)]
pub struct Decoded {
    pub entries: Vec<WalEntry>,
    /// Length of the well-formed prefix.
    pub valid_len: u64,
    /// Why the bytes after `valid_len` were rejected, if any.
    pub torn: Option<String>,
}

pub fn decode_frames(buf: &[u8]) -> Result<Decoded, WalError> {
    let mut entries = Vec::new();
    let mut off = 0usize;
    let torn = |off: usize, reason: String, entries: Vec<WalEntry>| {
        Ok(Decoded { entries, valid_len: off as u64, torn: Some(reason) })
    };
    while off < buf.len() {
        let rest = &buf[off..];
        if rest.len() < HEADER_LEN {
            return torn(off, format!("{} trailing header bytes", rest.len()), entries);
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len > MAX_FRAME {
            if off + HEADER_LEN >= buf.len() {
                return torn(off, format!("oversized final frame length {}", len), entries);
            }
            return Err(WalError::Corrupted { offset: off as u64, reason: format!("frame length {}", len) });
        }
        if rest.len() < HEADER_LEN + len {
            return torn(off, format!("frame needs {} bytes, {} present", len, rest.len() - HEADER_LEN), entries);
        }
        let payload = &rest[HEADER_LEN..HEADER_LEN + len];
        let is_last = off + HEADER_LEN + len == buf.len();
        if rest[4..8] != checksum(payload) {
            if is_last {
                return torn(off, "checksum mismatch in final frame".into(), entries);
            }
            return Err(WalError::Corrupted { offset: off as u64, reason: "checksum mismatch".into() });
        }
        let entry: WalEntry = bincode::deserialize(payload)
            .map_err(|e| WalError::Corrupted { offset: off as u64, reason: e.to_string() })?;
        entries.push(entry);
        off += HEADER_LEN + len;
    }
    Ok(Decoded { entries, valid_len: off as u64, torn: None })
}

pub struct Wal {
    path: PathBuf,
    file: File,
    sync: bool,
}

impl Wal {
    /// Opens (or creates) the log, truncating a torn tail.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let decoded = decode_frames(&buf)?;
        if let Some(reason) = decoded.torn {
            warn!(path = %path.display(), valid_len = decoded.valid_len, %reason, "truncating torn wal tail");
            file.set_len(decoded.valid_len)?;
            file.sync_all()?;
        }
        debug!(path = %path.display(), entries = decoded.entries.len(), "wal opened");
        Ok(Self { path, file, sync })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<(), WalError> {
        let frame = encode_frame(entry)?;
        self.file.write_all(&frame)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Forces everything appended so far to disk.
    pub fn flush_sync(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<WalEntry>, WalError> {
        Ok(read_entries(&self.path)?.entries)
    }

    /// Rewrites the log without entries of heights below `height`. Returns how many were
    /// dropped. Callers pass a bound at or below the last committed height.
    pub fn prune_below(&mut self, height: Height) -> Result<usize, WalError> {
        let entries = self.read_all()?;
        let keep: Vec<&WalEntry> = entries.iter().filter(|e| e.event_height() >= height).collect();
        let dropped = entries.len() - keep.len();
        if dropped == 0 {
            return Ok(0);
        }
        let tmp = self.path.with_extension("compact");
        {
            let mut out = File::create(&tmp)?;
            for entry in &keep {
                out.write_all(&encode_frame(entry)?)?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        info!(below = height, dropped, kept = keep.len(), "wal compacted");
        Ok(dropped)
    }
}

/// Reads a log without modifying it. A torn tail is reported, not removed.
pub fn read_entries(path: impl AsRef<Path>) -> Result<Decoded, WalError> {
    let mut buf = Vec::new();
    match File::open(path.as_ref()) {
        Ok(mut f) => {
            f.read_to_end(&mut buf)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    decode_frames(&buf)
}
