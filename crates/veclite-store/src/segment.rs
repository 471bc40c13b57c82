#![allow(clippy::cast_possible_truncation)]

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Read, Write};
use veclite_core::{Result, VecliteError, MAX_META_BYTES};

/// `VCSG` little-endian.
pub const SEGMENT_MAGIC: u32 = u32::from_le_bytes(*b"VCSG");
pub const SEGMENT_VERSION: u32 = 1;

/// Header: magic u32 | version u32 | dim u32 | row_count u32 | checksum u64.
pub const SEGMENT_HEADER_BYTES: usize = 24;

/// One record inside a packed segment frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRow {
    pub id: u32,
    pub meta: Option<Bytes>,
    pub vector: Vec<f32>,
}

impl SegmentRow {
    /// Encoded size of this row: id + meta_len + meta + vector.
    pub fn encoded_len(&self, dim: usize) -> usize {
        4 + 4 + self.meta.as_ref().map_or(0, Bytes::len) + dim * 4
    }
}

/// 64-bit content checksum over the row region.
pub fn body_checksum(body: &[u8]) -> u64 {
    let hash = blake3::hash(body);
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("hash is 32 bytes"))
}

/// Stored checksum of an encoded frame, without decoding the rows.
pub fn frame_checksum(frame: &[u8]) -> Option<u64> {
    frame
        .get(16..24)
        .map(|b| u64::from_le_bytes(b.try_into().expect("8-byte slice")))
}

/// Packs rows into one immutable segment frame.
pub fn encode_segment(dim: usize, rows: &[SegmentRow]) -> Result<Bytes> {
    let mut body = Vec::with_capacity(rows.len() * (8 + dim * 4));
    for row in rows {
        if row.vector.len() != dim {
            return Err(VecliteError::DimensionMismatch {
                expected: dim,
                got: row.vector.len(),
            });
        }
        let meta = row.meta.as_deref().unwrap_or(&[]);
        if meta.len() > MAX_META_BYTES {
            return Err(VecliteError::InvalidVector(format!(
                "meta for id {} exceeds {MAX_META_BYTES} bytes",
                row.id
            )));
        }
        body.write_u32::<LittleEndian>(row.id)?;
        body.write_u32::<LittleEndian>(meta.len() as u32)?;
        body.write_all(meta)?;
        for &x in &row.vector {
            body.write_f32::<LittleEndian>(x)?;
        }
    }

    let mut out = Vec::with_capacity(SEGMENT_HEADER_BYTES + body.len());
    out.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
    out.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
    out.write_u32::<LittleEndian>(dim as u32)?;
    out.write_u32::<LittleEndian>(rows.len() as u32)?;
    out.write_u64::<LittleEndian>(body_checksum(&body))?;
    out.extend_from_slice(&body);
    Ok(Bytes::from(out))
}

/// Decodes and verifies one segment frame, returning `(dim, rows)`.
pub fn decode_segment(buf: &[u8]) -> Result<(usize, Vec<SegmentRow>)> {
    if buf.len() < SEGMENT_HEADER_BYTES {
        return Err(VecliteError::corrupt(0, "segment shorter than header"));
    }
    let mut cursor = Cursor::new(buf);
    let magic = cursor.read_u32::<LittleEndian>()?;
    if magic != SEGMENT_MAGIC {
        return Err(VecliteError::corrupt(0, "bad segment magic"));
    }
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != SEGMENT_VERSION {
        return Err(VecliteError::VersionUnsupported(version));
    }
    let dim = cursor.read_u32::<LittleEndian>()? as usize;
    let row_count = cursor.read_u32::<LittleEndian>()? as usize;
    let stored_checksum = cursor.read_u64::<LittleEndian>()?;

    let body = &buf[SEGMENT_HEADER_BYTES..];
    if body_checksum(body) != stored_checksum {
        return Err(VecliteError::corrupt(
            SEGMENT_HEADER_BYTES as u64,
            "segment checksum mismatch",
        ));
    }

    let mut rows = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let offset = cursor.position();
        let id = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| VecliteError::corrupt(offset, "truncated row header"))?;
        let meta_len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| VecliteError::corrupt(offset, "truncated row header"))?
            as usize;
        if meta_len > MAX_META_BYTES {
            return Err(VecliteError::corrupt(offset, "row meta length exceeds cap"));
        }
        let meta = if meta_len == 0 {
            None
        } else {
            let mut m = vec![0u8; meta_len];
            cursor
                .read_exact(&mut m)
                .map_err(|_| VecliteError::corrupt(offset, "truncated row meta"))?;
            Some(Bytes::from(m))
        };
        let mut vector = Vec::with_capacity(dim);
        for _ in 0..dim {
            vector.push(
                cursor
                    .read_f32::<LittleEndian>()
                    .map_err(|_| VecliteError::corrupt(offset, "truncated row vector"))?,
            );
        }
        rows.push(SegmentRow { id, meta, vector });
    }
    if cursor.position() as usize != buf.len() {
        return Err(VecliteError::corrupt(
            cursor.position(),
            "trailing bytes after last row",
        ));
    }
    Ok((dim, rows))
}

/// Splits rows into chunks whose encoded frame size stays at or under
/// `segment_bytes`. A single oversized row still gets its own segment.
pub fn plan_segments(dim: usize, rows: &[SegmentRow], segment_bytes: usize) -> Vec<Vec<SegmentRow>> {
    let mut out = Vec::new();
    let mut current: Vec<SegmentRow> = Vec::new();
    let mut current_bytes = SEGMENT_HEADER_BYTES;
    for row in rows {
        let len = row.encoded_len(dim);
        if !current.is_empty() && current_bytes + len > segment_bytes {
            out.push(std::mem::take(&mut current));
            current_bytes = SEGMENT_HEADER_BYTES;
        }
        current.push(row.clone());
        current_bytes += len;
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<SegmentRow> {
        vec![
            SegmentRow {
                id: 1,
                meta: Some(Bytes::from_static(b"{\"a\":1}")),
                vector: vec![1.0, 2.0, 3.0],
            },
            SegmentRow {
                id: 7,
                meta: None,
                vector: vec![-1.0, 0.5, 0.0],
            },
        ]
    }

    #[test]
    fn round_trip() {
        let buf = encode_segment(3, &rows()).unwrap();
        let (dim, decoded) = decode_segment(&buf).unwrap();
        assert_eq!(dim, 3);
        assert_eq!(decoded, rows());
    }

    #[test]
    fn checksum_detects_flipped_byte() {
        let mut buf = encode_segment(3, &rows()).unwrap().to_vec();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert!(matches!(
            decode_segment(&buf),
            Err(VecliteError::Corrupt { .. })
        ));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut buf = encode_segment(3, &rows()).unwrap().to_vec();
        buf[0] = b'X';
        assert!(matches!(
            decode_segment(&buf),
            Err(VecliteError::Corrupt { .. })
        ));
    }

    #[test]
    fn plan_respects_budget() {
        let many: Vec<SegmentRow> = (0..100)
            .map(|i| SegmentRow {
                id: i,
                meta: None,
                vector: vec![0.0; 8],
            })
            .collect();
        let row_len = many[0].encoded_len(8);
        let per_segment = 4;
        let plans = plan_segments(8, &many, SEGMENT_HEADER_BYTES + row_len * per_segment);
        assert_eq!(plans.len(), 25);
        assert!(plans.iter().all(|p| p.len() == per_segment));
        let total: usize = plans.iter().map(Vec::len).sum();
        assert_eq!(total, 100);
    }
}
