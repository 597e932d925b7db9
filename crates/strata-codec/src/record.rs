use crate::pack::{pack, unpack};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Cursor, Read, Write};
use strata_common::{DecodeError, StoredChunk, VoxelChunk, VOXEL_COUNT};

pub const RECORD_MAGIC: &[u8; 4] = b"STRC";
pub const RECORD_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 1;

const KIND_SLICE: u8 = 1;
const KIND_VOXELS: u8 = 2;

/// Self-describing record: magic, version, kind, then the payload.
pub fn encode_record(chunk: &StoredChunk) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + VOXEL_COUNT);
    out.extend_from_slice(RECORD_MAGIC);
    let _ = out.write_u16::<LittleEndian>(RECORD_VERSION);
    match chunk {
        StoredChunk::Slice(slice) => {
            out.push(KIND_SLICE);
            out.extend_from_slice(&pack(slice));
        }
        StoredChunk::Voxels(voxels) => {
            out.push(KIND_VOXELS);
            out.extend_from_slice(voxels.as_bytes());
        }
    }
    out
}

pub fn decode_record(bytes: &[u8]) -> Result<StoredChunk, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            len: bytes.len(),
            needed: HEADER_LEN,
        });
    }
    if &bytes[..4] != RECORD_MAGIC {
        return Err(DecodeError::BadMagic);
    }

    let mut reader = Cursor::new(&bytes[4..]);
    let truncated = |_| DecodeError::Truncated {
        len: bytes.len(),
        needed: HEADER_LEN,
    };
    let version = reader.read_u16::<LittleEndian>().map_err(truncated)?;
    if version != RECORD_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let kind = reader.read_u8().map_err(truncated)?;
    let payload = &bytes[HEADER_LEN..];

    match kind {
        KIND_SLICE => unpack(payload).map(StoredChunk::Slice),
        KIND_VOXELS => VoxelChunk::from_bytes(payload)
            .map(StoredChunk::Voxels)
            .ok_or(DecodeError::Truncated {
                len: payload.len(),
                needed: VOXEL_COUNT,
            }),
        other => Err(DecodeError::UnknownKind(other)),
    }
}

/// Encodes and zlib-compresses a chunk at `level` (0-9).
pub fn compress_record(chunk: &StoredChunk, level: u32) -> Result<Vec<u8>, DecodeError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(&encode_record(chunk))
        .map_err(|e| DecodeError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| DecodeError::Compression(e.to_string()))
}

pub fn decompress_record(bytes: &[u8]) -> Result<StoredChunk, DecodeError> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| DecodeError::Compression(e.to_string()))?;
    decode_record(&raw)
}
