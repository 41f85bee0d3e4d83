//! Binary chunk exchange format.
//!
//! All numbers are little-endian:
//!
//! ```text
//! u32  header_len
//! header (header_len bytes):
//!   u32 nbands, u32 nt, u32 ny, u32 nx
//!   f64 nodata
//!   nbands × (u32 name_len, name_len bytes of UTF-8)
//! payload: nbands × nt × ny × nx f64, band-major
//! ```
//!
//! The same layout carries chunks to and from external stream processes and
//! from remote swarm workers.

use crate::core::error::{ChunkError, ChunkResult};
use crate::core::types::ChunkData;

/// Header of an exchanged chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHeader {
    pub bands: Vec<String>,
    /// `(t, y, x)`.
    pub shape: [usize; 3],
    pub nodata: f64,
}

/// Serialize `chunk` with its band names.
pub fn encode(bands: &[String], chunk: &ChunkData) -> Vec<u8> {
    let [_, nt, ny, nx] = chunk.shape();
    let mut header = Vec::with_capacity(24 + bands.iter().map(|b| b.len() + 4).sum::<usize>());
    for n in [bands.len(), nt, ny, nx] {
        header.extend_from_slice(&(n as u32).to_le_bytes());
    }
    header.extend_from_slice(&chunk.nodata_value().to_le_bytes());
    for name in bands {
        header.extend_from_slice(&(name.len() as u32).to_le_bytes());
        header.extend_from_slice(name.as_bytes());
    }

    let mut out = Vec::with_capacity(4 + header.len() + chunk.as_slice().len() * 8);
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    for v in chunk.as_slice() {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &str) -> ChunkResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| malformed(format!("truncated {} at byte {}", what, self.pos)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self, what: &str) -> ChunkResult<usize> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }

    fn f64(&mut self, what: &str) -> ChunkResult<f64> {
        let b = self.take(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }
}

fn malformed(reason: String) -> ChunkError {
    ChunkError::StreamMalformed { reason }
}

/// Parse a serialized chunk.
pub fn decode(bytes: &[u8]) -> ChunkResult<(ChunkHeader, ChunkData)> {
    let mut reader = Reader { bytes, pos: 0 };
    let header_len = reader.u32("header length")?;
    let header_end = 4 + header_len;

    let nbands = reader.u32("band count")?;
    let nt = reader.u32("t size")?;
    let ny = reader.u32("y size")?;
    let nx = reader.u32("x size")?;
    let nodata = reader.f64("nodata")?;
    let mut names = Vec::with_capacity(nbands.min(4096));
    for _ in 0..nbands {
        let len = reader.u32("band name length")?;
        let raw = reader.take(len, "band name")?;
        let name = std::str::from_utf8(raw)
            .map_err(|e| malformed(format!("band name is not UTF-8: {}", e)))?;
        names.push(name.to_string());
    }
    if reader.pos != header_end {
        return Err(malformed(format!(
            "header length {} does not match header content ({} bytes)",
            header_len,
            reader.pos - 4
        )));
    }

    let cells = [nbands, nt, ny, nx]
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| malformed("chunk dimensions overflow".to_string()))?;
    let expected = cells
        .checked_mul(8)
        .ok_or_else(|| malformed("chunk dimensions overflow".to_string()))?;
    let payload = &bytes[header_end..];
    if payload.len() != expected {
        return Err(malformed(format!(
            "payload has {} bytes, expected {} for {} × {} × {} × {}",
            payload.len(),
            expected,
            nbands,
            nt,
            ny,
            nx
        )));
    }
    let data = payload
        .chunks_exact(8)
        .map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            f64::from_le_bytes(raw)
        })
        .collect();
    let chunk = ChunkData::from_vec([nbands, nt, ny, nx], data, nodata)
        .ok_or_else(|| malformed("payload does not match dimensions".to_string()))?;
    Ok((
        ChunkHeader {
            bands: names,
            shape: [nt, ny, nx],
            nodata,
        },
        chunk,
    ))
}
