#![allow(clippy::cast_possible_truncation)]

use crate::DynBlobStore;
use bytes::Bytes;
use tracing::warn;
use veclite_core::{Result, VecliteError, MAX_META_BYTES};

pub const WAL_MAGIC: [u8; 4] = *b"VLWA";
pub const WAL_VERSION: u32 = 1;

const REC_UPSERT: u8 = 1;
const REC_REMOVE: u8 = 2;
const REC_SET_META: u8 = 3;

// Sanity cap on the encoded vector length (4 MiB = 1M dims).
const MAX_VEC_BYTES: usize = 4 * 1024 * 1024;

/// One durable change record. Replay is idempotent: upsert is
/// replace-or-insert, remove is a no-op on a missing id, set-meta is a
/// conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Upsert {
        id: u32,
        vector: Vec<f32>,
        meta: Option<Bytes>,
    },
    Remove {
        id: u32,
    },
    SetMeta {
        id: u32,
        meta: Option<Bytes>,
    },
}

/// Encodes records as one `VLWA` frame. Frames may be concatenated in a
/// blob; the decoder resynchronizes at each frame header.
pub fn encode_frame(records: &[WalRecord]) -> Bytes {
    let mut buf = Vec::with_capacity(16 + records.len() * 32);
    buf.extend_from_slice(&WAL_MAGIC);
    buf.extend_from_slice(&WAL_VERSION.to_le_bytes());
    for rec in records {
        let (ty, id, meta, vec) = match rec {
            WalRecord::Upsert { id, vector, meta } => {
                (REC_UPSERT, *id, meta.as_deref(), Some(vector.as_slice()))
            }
            WalRecord::Remove { id } => (REC_REMOVE, *id, None, None),
            WalRecord::SetMeta { id, meta } => (REC_SET_META, *id, meta.as_deref(), None),
        };
        let meta_bytes = meta.unwrap_or(&[]);
        buf.push(ty);
        buf.push(0); // reserved
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&(meta_bytes.len() as u32).to_le_bytes());
        let vec_bytes_len = vec.map_or(0, |v| v.len() * 4);
        buf.extend_from_slice(&(vec_bytes_len as u32).to_le_bytes());
        buf.extend_from_slice(meta_bytes);
        if let Some(v) = vec {
            for &x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
    }
    Bytes::from(buf)
}

/// Decodes every record in `buf`.
///
/// A truncated tail (a record or frame header cut off by the end of the
/// blob) is discarded silently; anything structurally invalid before that
/// surfaces as `Corrupt` with the byte offset, and replay must abort.
pub fn decode(buf: &[u8]) -> Result<Vec<WalRecord>> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    let mut in_frame = false;

    while pos < buf.len() {
        let remaining = &buf[pos..];

        // Frame boundary: a new magic may follow any complete record.
        if remaining.starts_with(&WAL_MAGIC) {
            if remaining.len() < 8 {
                // Torn frame header.
                warn!(offset = pos, "discarding torn WAL frame header");
                break;
            }
            let version = u32::from_le_bytes([
                remaining[4],
                remaining[5],
                remaining[6],
                remaining[7],
            ]);
            if version != WAL_VERSION {
                return Err(VecliteError::VersionUnsupported(version));
            }
            pos += 8;
            in_frame = true;
            continue;
        }
        if !in_frame {
            return Err(VecliteError::corrupt(pos as u64, "missing VLWA magic"));
        }

        // Record header: type, reserved, id, meta_len, vec_len.
        if remaining.len() < 14 {
            warn!(offset = pos, "discarding torn WAL record header");
            break;
        }
        let ty = remaining[0];
        let id = u32::from_le_bytes([remaining[2], remaining[3], remaining[4], remaining[5]]);
        let meta_len =
            u32::from_le_bytes([remaining[6], remaining[7], remaining[8], remaining[9]]) as usize;
        let vec_len =
            u32::from_le_bytes([remaining[10], remaining[11], remaining[12], remaining[13]])
                as usize;

        if !(REC_UPSERT..=REC_SET_META).contains(&ty) {
            return Err(VecliteError::corrupt(
                pos as u64,
                format!("unknown WAL record type {ty}"),
            ));
        }
        if meta_len > MAX_META_BYTES {
            return Err(VecliteError::corrupt(
                pos as u64,
                format!("meta length {meta_len} exceeds cap"),
            ));
        }
        if vec_len > MAX_VEC_BYTES || vec_len % 4 != 0 {
            return Err(VecliteError::corrupt(
                pos as u64,
                format!("bad vector length {vec_len}"),
            ));
        }
        match ty {
            REC_REMOVE if meta_len != 0 || vec_len != 0 => {
                return Err(VecliteError::corrupt(pos as u64, "remove carries payload"));
            }
            REC_SET_META if vec_len != 0 => {
                return Err(VecliteError::corrupt(pos as u64, "set-meta carries vector"));
            }
            _ => {}
        }

        let body_len = 14 + meta_len + vec_len;
        if remaining.len() < body_len {
            warn!(offset = pos, "discarding torn WAL record body");
            break;
        }

        let meta_bytes = &remaining[14..14 + meta_len];
        let meta = if meta_len == 0 {
            None
        } else {
            Some(Bytes::copy_from_slice(meta_bytes))
        };

        let rec = match ty {
            REC_UPSERT => {
                let vec_bytes = &remaining[14 + meta_len..body_len];
                let mut vector = Vec::with_capacity(vec_len / 4);
                for chunk in vec_bytes.chunks_exact(4) {
                    vector.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
                WalRecord::Upsert { id, vector, meta }
            }
            REC_REMOVE => WalRecord::Remove { id },
            REC_SET_META => WalRecord::SetMeta { id, meta },
            _ => unreachable!("validated above"),
        };
        records.push(rec);
        pos += body_len;
    }

    Ok(records)
}

/// Append-only WAL bound to one blob key. The single writer appends one
/// frame per mutation batch; truncation happens only after a successful
/// HEAD commit.
pub struct WalWriter {
    store: DynBlobStore,
    key: String,
}

impl WalWriter {
    pub fn new(store: DynBlobStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn append(&self, records: &[WalRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.store.append(&self.key, encode_frame(records)).await
    }

    /// Reads back every decodable record. A missing blob is an empty log.
    pub async fn load(&self) -> Result<Vec<WalRecord>> {
        match self.store.read(&self.key).await {
            Ok(buf) => decode(&buf),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn truncate(&self) -> Result<()> {
        self.store.del(&self.key).await
    }
}
