use crc32fast::Hasher;

use crate::{
    error::{corrupt, Result},
    row::ChecksumRow,
};

/// Number of data/null rows covered by each checksum row.
///
/// We limit ourselves to a much smaller interval in test, because it lets us
/// exercise block rollover and checksum interleaving without writing (and
/// fsyncing) ten thousand rows per case.
#[cfg(not(test))]
pub const CHECKSUM_INTERVAL: u64 = 10_000;
#[cfg(test)]
pub const CHECKSUM_INTERVAL: u64 = 25;

pub(crate) fn create_block_hasher() -> Hasher {
    Hasher::new()
}

/// Whether the given physical row index is occupied by a checksum row.
///
/// Checksum rows sit at index 0 (covering the header) and then after every
/// `CHECKSUM_INTERVAL` non-checksum rows, i.e. at every multiple of
/// `CHECKSUM_INTERVAL + 1`.
pub fn is_checksum_index(physical: u64) -> bool {
    physical % (CHECKSUM_INTERVAL + 1) == 0
}

/// Maps an index in the logical space of data/null rows to its physical row
/// index, accounting for the interleaved checksum rows.
pub fn logical_to_physical(logical: u64) -> u64 {
    logical + logical / CHECKSUM_INTERVAL + 1
}

/// Maps a physical row index back into the logical space, or `None` for a
/// checksum row.
pub fn physical_to_logical(physical: u64) -> Option<u64> {
    if is_checksum_index(physical) {
        None
    } else {
        Some(physical - physical / (CHECKSUM_INTERVAL + 1) - 1)
    }
}

/// Number of data/null rows among the first `physical` row slots.
pub(crate) fn logical_len(physical: u64) -> u64 {
    if physical == 0 {
        return 0;
    }
    let checksum_rows = (physical - 1) / (CHECKSUM_INTERVAL + 1) + 1;
    physical - checksum_rows
}

/// Running CRC32 over the current block.
///
/// The tally digests every byte of each finalized non-checksum row in
/// append order; when the block is full the accumulated CRC becomes the
/// next [`ChecksumRow`].  The very first block consists solely of the
/// 64-byte header.
#[derive(Clone, Debug)]
pub(crate) struct BlockTally {
    hasher: Hasher,
    rows_in_block: u64,
}

impl BlockTally {
    pub fn new() -> Self {
        Self {
            hasher: create_block_hasher(),
            rows_in_block: 0,
        }
    }

    /// Digests the header bytes that the initial checksum row covers.
    pub fn absorb_header(&mut self, header_bytes: &[u8]) {
        debug_assert_eq!(self.rows_in_block, 0);
        self.hasher.update(header_bytes);
    }

    /// Digests one finalized non-checksum row.
    pub fn absorb_row(&mut self, row_bytes: &[u8]) {
        self.hasher.update(row_bytes);
        self.rows_in_block += 1;
    }

    /// Whether the block has reached the checksum interval and a checksum
    /// row must be emitted before any further row is accepted.
    pub fn block_full(&self) -> bool {
        self.rows_in_block == CHECKSUM_INTERVAL
    }

    pub fn current_crc(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Closes the current block, producing the checksum row that covers it
    /// and resetting the tally for the next block.
    pub fn emit(&mut self) -> ChecksumRow {
        let crc = self.current_crc();
        self.hasher = create_block_hasher();
        self.rows_in_block = 0;
        ChecksumRow { crc }
    }

    /// Verifies a checksum row read from the file against the running CRC,
    /// then resets the tally for the next block.
    ///
    /// # Errors
    ///
    /// If the stored CRC does not equal the CRC accumulated over the block,
    /// a corruption error naming both values will be returned.
    pub fn verify(&mut self, index: u64, row: &ChecksumRow) -> Result<()> {
        let calculated = self.current_crc();
        if calculated != row.crc {
            return Err(corrupt(format!(
                "checksum row at index {} stores CRC32 {:08X}, block hashes to {:08X}",
                index, row.crc, calculated
            )));
        }
        self.hasher = create_block_hasher();
        self.rows_in_block = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_indices_follow_the_interval() {
        assert!(is_checksum_index(0));
        assert!(!is_checksum_index(1));
        assert!(!is_checksum_index(CHECKSUM_INTERVAL));
        assert!(is_checksum_index(CHECKSUM_INTERVAL + 1));
        assert!(is_checksum_index(2 * (CHECKSUM_INTERVAL + 1)));
    }

    #[test]
    fn logical_physical_mapping_is_inverse() {
        for logical in 0..(CHECKSUM_INTERVAL * 3) {
            let physical = logical_to_physical(logical);
            assert!(
                !is_checksum_index(physical),
                "logical {logical} mapped onto a checksum slot"
            );
            assert_eq!(physical_to_logical(physical), Some(logical));
        }
        assert_eq!(physical_to_logical(0), None);
        assert_eq!(physical_to_logical(CHECKSUM_INTERVAL + 1), None);
    }

    #[test]
    fn logical_len_counts_only_data_slots() {
        assert_eq!(logical_len(0), 0);
        assert_eq!(logical_len(1), 0);
        assert_eq!(logical_len(2), 1);
        assert_eq!(logical_len(CHECKSUM_INTERVAL + 1), CHECKSUM_INTERVAL);
        // One full block plus its trailing checksum row.
        assert_eq!(logical_len(CHECKSUM_INTERVAL + 2), CHECKSUM_INTERVAL);
        assert_eq!(logical_len(CHECKSUM_INTERVAL + 3), CHECKSUM_INTERVAL + 1);
    }

    #[test]
    fn tally_matches_straight_crc32() {
        let mut tally = BlockTally::new();
        tally.absorb_header(b"header bytes");
        let mut expected = create_block_hasher();
        expected.update(b"header bytes");
        assert_eq!(tally.current_crc(), expected.finalize());

        let row = tally.emit();
        let mut verify_tally = BlockTally::new();
        verify_tally.absorb_header(b"header bytes");
        verify_tally.verify(0, &row).expect("verification should succeed");
    }

    #[test]
    fn verify_rejects_mismatch_and_resets_on_success() {
        let mut tally = BlockTally::new();
        tally.absorb_row(b"row one");
        let bogus = ChecksumRow { crc: 0 };
        assert!(tally.verify(1, &bogus).is_err());

        let good = ChecksumRow {
            crc: tally.current_crc(),
        };
        tally.verify(1, &good).expect("verification should succeed");
        assert_eq!(tally.rows_in_block, 0);
    }

    #[test]
    fn block_full_after_interval_rows() {
        let mut tally = BlockTally::new();
        for _ in 0..CHECKSUM_INTERVAL {
            assert!(!tally.block_full());
            tally.absorb_row(b"row");
        }
        assert!(tally.block_full());
        tally.emit();
        assert!(!tally.block_full());
    }
}
