//! Length and CRC framing for files written by the stores.
//!
//! On-disk format:
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload]
//! ```

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{StoreError, StoreResult};

/// Header size: 4 bytes length + 4 bytes CRC.
pub const HEADER_SIZE: usize = 8;

/// Wrap `payload` in a length + CRC header.
pub fn encode_frame(payload: &[u8]) -> StoreResult<Vec<u8>> {
    let length = u32::try_from(payload.len())
        .map_err(|_| StoreError::CorruptFrame(format!("payload too large: {}", payload.len())))?;
    let crc = crc32fast::hash(payload);

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Validate the header of a single frame and return its payload.
pub fn decode_frame(bytes: &[u8]) -> StoreResult<&[u8]> {
    if bytes.len() < HEADER_SIZE {
        return Err(StoreError::CorruptFrame(format!(
            "truncated header: {} bytes",
            bytes.len()
        )));
    }
    let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let expected_crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != length {
        return Err(StoreError::CorruptFrame(format!(
            "length mismatch: header says {length}, found {}",
            payload.len()
        )));
    }
    let actual_crc = crc32fast::hash(payload);
    if actual_crc != expected_crc {
        return Err(StoreError::CorruptFrame(format!(
            "crc mismatch: expected {expected_crc:08x}, computed {actual_crc:08x}"
        )));
    }
    Ok(payload)
}

/// Write a framed payload to `path` through a temporary sibling and rename,
/// so readers never observe a half-written file.
pub fn write_framed_file(path: &Path, payload: &[u8]) -> StoreResult<()> {
    let framed = encode_frame(payload)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&framed)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a framed file and return its validated payload.
pub fn read_framed_file(path: &Path) -> StoreResult<Vec<u8>> {
    let bytes = fs::read(path)?;
    decode_frame(&bytes).map(<[u8]>::to_vec)
}
