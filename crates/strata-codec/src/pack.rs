use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use strata_common::{ColumnSlice, DecodeError, COLUMN_COUNT};

pub const PACK_MAGIC: &[u8; 4] = b"CHNK";
pub const PACK_VERSION: u16 = 1;
/// magic + version + pixels + heights
pub const PACKED_LEN: usize = 4 + 2 + COLUMN_COUNT * 4 + COLUMN_COUNT;

/// Serializes a slice into the fixed little-endian `CHNK` layout.
pub fn pack(slice: &ColumnSlice) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACKED_LEN);
    out.extend_from_slice(PACK_MAGIC);
    // Writing into a Vec cannot fail.
    let _ = out.write_u16::<LittleEndian>(PACK_VERSION);
    for &pixel in slice.pixels() {
        let _ = out.write_u32::<LittleEndian>(pixel);
    }
    out.extend_from_slice(slice.heights());
    out
}

pub fn unpack(bytes: &[u8]) -> Result<ColumnSlice, DecodeError> {
    if bytes.len() < PACKED_LEN {
        return Err(DecodeError::Truncated {
            len: bytes.len(),
            needed: PACKED_LEN,
        });
    }
    if &bytes[..4] != PACK_MAGIC {
        return Err(DecodeError::BadMagic);
    }

    let mut reader = Cursor::new(&bytes[4..PACKED_LEN]);
    let truncated = |_| DecodeError::Truncated {
        len: bytes.len(),
        needed: PACKED_LEN,
    };
    let version = reader.read_u16::<LittleEndian>().map_err(truncated)?;
    if version != PACK_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let mut pixels = [0u32; COLUMN_COUNT];
    reader
        .read_u32_into::<LittleEndian>(&mut pixels)
        .map_err(truncated)?;
    let mut heights = [0u8; COLUMN_COUNT];
    reader.read_exact(&mut heights).map_err(truncated)?;

    Ok(ColumnSlice::from_arrays(pixels, heights))
}
