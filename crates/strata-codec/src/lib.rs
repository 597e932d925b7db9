//! Wire and on-disk encodings for chunk data.
//!
//! * [`decode`] turns the compact `getchunkdata` token stream into a [`ColumnSlice`](strata_common::ColumnSlice).
//! * [`pack`]/[`unpack`] implement the fixed 1286-byte `CHNK` slice layout.
//! * [`encode_record`]/[`decode_record`] wrap any [`StoredChunk`](strata_common::StoredChunk) in a
//!   self-describing `STRC` record, and the `compress_*` variants add zlib.

pub mod pack;
pub mod record;
pub mod token;

pub use pack::{pack, unpack, PACKED_LEN};
pub use record::{compress_record, decode_record, decompress_record, encode_record};
pub use token::{assemble_slices, decode};
