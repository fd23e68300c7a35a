//! Fixed-size bit vector over `u64` words.
//!
//! Bit `i` lives in word `i / 64` at position `i % 64`; a set bit means
//! the unit is allocated. Serialization is the little-endian word array,
//! and `checksum` is CRC32c over that serialization, so the journaled
//! before/after checksums of a bitmap mutation are stable across hosts.

use fj_error::{JournalError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len_bits: u64,
}

impl Bitmap {
    /// All-zero bitmap of `len_bits` bits.
    #[must_use]
    pub fn new(len_bits: u64) -> Self {
        let words = len_bits.div_ceil(64) as usize;
        Self {
            words: vec![0; words],
            len_bits,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.len_bits
    }

    /// Number of set bits.
    #[must_use]
    pub fn popcount(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Number of zero bits.
    #[must_use]
    pub fn free(&self) -> u64 {
        self.len_bits - self.popcount()
    }

    pub fn test(&self, bit: u64) -> Result<bool> {
        self.check(bit)?;
        Ok(self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    /// Set a bit; returns whether it was already set.
    pub fn set(&mut self, bit: u64) -> Result<bool> {
        self.check(bit)?;
        let word = &mut self.words[(bit / 64) as usize];
        let mask = 1_u64 << (bit % 64);
        let was_set = *word & mask != 0;
        *word |= mask;
        Ok(was_set)
    }

    /// Clear a bit; returns whether it was set.
    pub fn clear(&mut self, bit: u64) -> Result<bool> {
        self.check(bit)?;
        let word = &mut self.words[(bit / 64) as usize];
        let mask = 1_u64 << (bit % 64);
        let was_set = *word & mask != 0;
        *word &= !mask;
        Ok(was_set)
    }

    /// First zero bit, if any.
    #[must_use]
    pub fn find_first_zero(&self) -> Option<u64> {
        for (i, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let bit = (i as u64) * 64 + u64::from(word.trailing_ones());
                if bit < self.len_bits {
                    return Some(bit);
                }
            }
        }
        None
    }

    /// First run of `len` zero bits starting at a multiple of `alignment`.
    ///
    /// Alignment 1 degenerates to first-fit. `alignment` must be a
    /// non-zero power of two.
    #[must_use]
    pub fn find_zero_run(&self, len: u64, alignment: u64) -> Option<u64> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() || len > self.len_bits {
            return None;
        }
        let mut start = 0_u64;
        while start + len <= self.len_bits {
            match self.run_blocker(start, len) {
                None => return Some(start),
                Some(blocker) => {
                    // Jump past the set bit to the next aligned start.
                    start = (blocker + 1).next_multiple_of(alignment);
                }
            }
        }
        None
    }

    /// Smallest zero run of at least `len` bits at `alignment`; first fit
    /// among equals.
    #[must_use]
    pub fn find_best_zero_run(&self, len: u64, alignment: u64) -> Option<u64> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return None;
        }
        let mut best: Option<(u64, u64)> = None; // (run_len, start)
        let mut bit = 0_u64;
        while bit < self.len_bits {
            if self.test(bit).ok()? {
                bit += 1;
                continue;
            }
            let run_start = bit;
            while bit < self.len_bits && !self.test(bit).ok()? {
                bit += 1;
            }
            let run_end = bit;
            // Usable portion begins at the first aligned bit in the run.
            let aligned = run_start.next_multiple_of(alignment);
            if aligned < run_end && run_end - aligned >= len {
                let usable = run_end - aligned;
                if best.map_or(true, |(b, _)| usable < b) {
                    best = Some((usable, aligned));
                }
            }
        }
        best.map(|(_, start)| start)
    }

    /// Length of the longest zero run.
    #[must_use]
    pub fn longest_zero_run(&self) -> u64 {
        let mut longest = 0_u64;
        let mut current = 0_u64;
        for bit in 0..self.len_bits {
            let set = self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0;
            if set {
                current = 0;
            } else {
                current += 1;
                longest = longest.max(current);
            }
        }
        longest
    }

    /// CRC32c over the little-endian word serialization.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        crc32c::crc32c(&self.to_bytes())
    }

    /// Little-endian word serialization.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 8);
        for word in &self.words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8], len_bits: u64) -> Result<Self> {
        let expected_words = len_bits.div_ceil(64) as usize;
        if bytes.len() != expected_words * 8 {
            return Err(JournalError::Format(format!(
                "bitmap serialization of {} bytes does not match {len_bits} bits",
                bytes.len()
            )));
        }
        let mut words = Vec::with_capacity(expected_words);
        for chunk in bytes.chunks_exact(8) {
            let mut word = [0_u8; 8];
            word.copy_from_slice(chunk);
            words.push(u64::from_le_bytes(word));
        }
        Ok(Self { words, len_bits })
    }

    /// First set bit of the would-be run, or `None` if the run is clear.
    fn run_blocker(&self, start: u64, len: u64) -> Option<u64> {
        for bit in start..start + len {
            if self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0 {
                return Some(bit);
            }
        }
        None
    }

    fn check(&self, bit: u64) -> Result<()> {
        if bit >= self.len_bits {
            return Err(JournalError::InvalidArgument(format!(
                "bit {bit} out of range for {}-bit bitmap",
                self.len_bits
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_test_round_trip() {
        let mut bm = Bitmap::new(100);
        assert!(!bm.set(5).expect("set"));
        assert!(bm.set(5).expect("set again"));
        assert!(bm.test(5).expect("test"));
        assert!(bm.clear(5).expect("clear"));
        assert!(!bm.clear(5).expect("clear again"));
        assert!(!bm.test(5).expect("test"));
        assert!(bm.test(200).is_err());
    }

    #[test]
    fn popcount_plus_free_equals_capacity() {
        let mut bm = Bitmap::new(257);
        for bit in [0, 63, 64, 127, 200, 256] {
            bm.set(bit).expect("set");
            assert_eq!(bm.popcount() + bm.free(), bm.capacity());
        }
        for bit in [63, 200] {
            bm.clear(bit).expect("clear");
            assert_eq!(bm.popcount() + bm.free(), bm.capacity());
        }
        assert_eq!(bm.popcount(), 4);
    }

    #[test]
    fn find_first_zero_skips_full_words() {
        let mut bm = Bitmap::new(130);
        for bit in 0..64 {
            bm.set(bit).expect("set");
        }
        assert_eq!(bm.find_first_zero(), Some(64));
        for bit in 64..130 {
            bm.set(bit).expect("set");
        }
        assert_eq!(bm.find_first_zero(), None);
    }

    #[test]
    fn zero_run_respects_alignment() {
        let mut bm = Bitmap::new(64);
        // Occupy bits 0..3; a run of 5 at alignment 8 must start at 8.
        for bit in 0..3 {
            bm.set(bit).expect("set");
        }
        assert_eq!(bm.find_zero_run(5, 8), Some(8));
        assert_eq!(bm.find_zero_run(5, 1), Some(3));

        // Block the bit at 8 and the aligned run moves to 16.
        bm.set(8).expect("set");
        assert_eq!(bm.find_zero_run(5, 8), Some(16));
    }

    #[test]
    fn zero_run_rejects_degenerate_requests() {
        let bm = Bitmap::new(32);
        assert_eq!(bm.find_zero_run(0, 1), None);
        assert_eq!(bm.find_zero_run(4, 0), None);
        assert_eq!(bm.find_zero_run(4, 3), None);
        assert_eq!(bm.find_zero_run(64, 1), None);
    }

    #[test]
    fn best_fit_prefers_the_tightest_run() {
        let mut bm = Bitmap::new(64);
        // Runs: [0..10) free, bit 10 set, [11..15) free, bit 15 set, rest free.
        bm.set(10).expect("set");
        bm.set(15).expect("set");
        for bit in 30..64 {
            bm.set(bit).expect("set");
        }
        // A 4-bit request fits exactly in the [11..15) hole.
        assert_eq!(bm.find_best_zero_run(4, 1), Some(11));
        // First-fit takes the big hole at the front.
        assert_eq!(bm.find_zero_run(4, 1), Some(0));
    }

    #[test]
    fn longest_zero_run_tracks_fragmentation() {
        let mut bm = Bitmap::new(32);
        assert_eq!(bm.longest_zero_run(), 32);
        bm.set(16).expect("set");
        assert_eq!(bm.longest_zero_run(), 16);
        for bit in (0..32).step_by(2) {
            bm.set(bit).expect("set");
        }
        assert_eq!(bm.longest_zero_run(), 1);
    }

    #[test]
    fn serialization_and_checksum_round_trip() {
        let mut bm = Bitmap::new(100);
        for bit in [1, 50, 99] {
            bm.set(bit).expect("set");
        }
        let bytes = bm.to_bytes();
        let restored = Bitmap::from_bytes(&bytes, 100).expect("restore");
        assert_eq!(restored, bm);
        assert_eq!(restored.checksum(), bm.checksum());

        let before = bm.checksum();
        bm.set(2).expect("set");
        assert_ne!(bm.checksum(), before);

        assert!(Bitmap::from_bytes(&bytes[..8], 100).is_err());
    }
}
