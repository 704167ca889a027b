//! Magic numbers of the on-wire binary formats.

// openssl::rand, frozen at format definition time

/// Plain content frame: `magic, crc32`, data.
pub const UNCOMPRESSED_FRAME_MAGIC_1_0: [u8; 8] = [37, 207, 101, 88, 14, 233, 177, 62];

/// Compressed content frame: `magic, crc32`, zstd data.
pub const COMPRESSED_FRAME_MAGIC_1_0: [u8; 8] = [140, 12, 219, 75, 180, 7, 244, 129];

/// Encrypted content frame: `magic, crc32, iv, tag`, cipher data.
pub const ENCRYPTED_FRAME_MAGIC_1_0: [u8; 8] = [66, 171, 53, 232, 99, 20, 141, 8];

/// Encrypted and compressed content frame: `magic, crc32, iv, tag`,
/// encrypted zstd data.
pub const ENCR_COMPR_FRAME_MAGIC_1_0: [u8; 8] = [202, 84, 5, 160, 51, 118, 29, 215];

/// Pack trailer: embedded pack index frame, its length and this magic at
/// the very end of every pack blob.
pub const PACK_TRAILER_MAGIC_1_0: [u8; 8] = [119, 44, 3, 184, 249, 86, 163, 30];

/// Index blob payload (inside an encrypted frame).
pub const INDEX_BLOB_MAGIC_1_0: [u8; 8] = [24, 190, 78, 155, 2, 109, 228, 71];

/// Format blob recovery copy at offset 0 of the first data pack:
/// `magic, u32 length`, raw format blob bytes.
pub const FORMAT_COPY_MAGIC_1_0: [u8; 8] = [93, 16, 136, 49, 218, 165, 60, 107];

/// Bytes every frame header has: magic plus crc32.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Header of an encrypted frame: magic, crc32, 16 byte IV, 16 byte tag.
pub const ENCRYPTED_FRAME_HEADER_SIZE: usize = FRAME_HEADER_SIZE + 16 + 16;

pub fn header_size(magic: &[u8; 8]) -> usize {
    match *magic {
        ENCRYPTED_FRAME_MAGIC_1_0 | ENCR_COMPR_FRAME_MAGIC_1_0 => ENCRYPTED_FRAME_HEADER_SIZE,
        _ => FRAME_HEADER_SIZE,
    }
}
