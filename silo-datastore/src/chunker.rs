//! Content-defined chunking.
//!
//! Streams are cut where a rolling hash over a small sliding window
//! lands on a fixed bit pattern, so chunk boundaries depend only on the
//! bytes near them: an insertion early in a file shifts at most one
//! chunk, everything after the next boundary realigns and deduplicates.
//!
//! The hash is a cyclic polynomial (rotate, then mix a per-byte table
//! value in and the expired one out). The table is not hand-picked: the
//! 256 mix values are the leading bytes of `SHA-256("silo chunk table
//! <i>")`, which pins them for all time without a wall of literals -
//! chunk boundaries, and therefore object ids, must never change
//! between versions.

use once_cell::sync::Lazy;

/// Sliding window width. Boundaries depend on exactly this many
/// trailing bytes.
const WINDOW: usize = 48;

/// Rotation a table value has accumulated by the time its byte leaves
/// the window: 48 single-bit rotations of a 32 bit word, i.e. 16.
const EXPIRE_ROTATION: u32 = (WINDOW % 32) as u32;

static MIX_TABLE: Lazy<[u32; 256]> = Lazy::new(|| {
    let mut table = [0u32; 256];
    for (byte, slot) in table.iter_mut().enumerate() {
        let digest = openssl::sha::sha256(format!("silo chunk table {}", byte).as_bytes());
        *slot = u32::from_be_bytes(digest[0..4].try_into().unwrap());
    }
    table
});

/// Splitter bounds, persisted in the repository format blob.
///
/// `avg` must be a power of two; boundaries are declared where the low
/// `log2(avg)` hash bits are all zero, so one qualifies about every
/// `avg` bytes once past `min`. `max` force-cuts runs (like long zero
/// stretches) where the hash never qualifies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitterConfig {
    pub min: usize,
    pub avg: usize,
    pub max: usize,
}

impl SplitterConfig {
    pub fn new(min: u32, avg: u32, max: u32) -> Self {
        Self {
            min: min as usize,
            avg: avg as usize,
            max: max as usize,
        }
    }
}

pub struct Chunker {
    hash: u32,
    /// Ring buffer of the last [`WINDOW`] bytes.
    window: [u8; WINDOW],
    cursor: usize,
    /// Bytes consumed since the last boundary.
    chunk_size: usize,
    min: usize,
    max: usize,
    boundary_mask: u32,
}

impl Chunker {
    pub fn new(config: &SplitterConfig) -> Self {
        assert!(
            config.avg.is_power_of_two(),
            "average chunk size must be a power of two"
        );
        assert!(
            WINDOW < config.min && config.min <= config.avg && config.avg <= config.max,
            "splitter bounds out of order"
        );

        Self {
            hash: 0,
            window: [0u8; WINDOW],
            cursor: 0,
            chunk_size: 0,
            min: config.min,
            max: config.max,
            boundary_mask: (config.avg - 1) as u32,
        }
    }

    /// Consume bytes until a chunk boundary.
    ///
    /// Returns the boundary position within `data`, or 0 when `data`
    /// ran out first; state carries over, so feeding one big slice or
    /// many small ones yields identical boundaries.
    pub fn scan(&mut self, data: &[u8]) -> usize {
        let mut pos = 0;

        while pos < data.len() {
            let entering = data[pos];
            let expiring = self.window[self.cursor];
            self.window[self.cursor] = entering;
            self.cursor += 1;
            if self.cursor == WINDOW {
                self.cursor = 0;
            }

            self.hash = self.hash.rotate_left(1)
                ^ MIX_TABLE[entering as usize]
                ^ MIX_TABLE[expiring as usize].rotate_left(EXPIRE_ROTATION);

            self.chunk_size += 1;
            pos += 1;

            // the window always holds stale zeroes for the first few
            // bytes of a chunk; harmless, since min is far larger
            if self.chunk_size >= self.min && self.hash & self.boundary_mask == 0
                || self.chunk_size >= self.max
            {
                self.reset();
                return pos;
            }
        }

        0
    }

    fn reset(&mut self) {
        self.hash = 0;
        self.window = [0u8; WINDOW];
        self.cursor = 0;
        self.chunk_size = 0;
    }
}
