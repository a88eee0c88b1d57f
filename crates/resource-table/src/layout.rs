//! Byte layout of the shared region.
//!
//! ```text
//! offset 0                  gpu_count (u32, written once at create)
//! offset 4                  mask slots: gpu_count x (word0: u32, word1: u32)
//! offset 4 + gpu_count * 8  process-shared lock (RawTableMutex)
//! ```
//!
//! Host-native byte order. The layout must be identical across the creator
//! and every attacher; all offsets below are the single source of truth.

use crate::mutex::RawTableMutex;

/// Words per mask slot.
pub const MASK_WORDS: usize = 2;

/// Valid mask bits per GPU: all 32 of `word0`, the low 28 of `word1`.
pub const MASK_BITS: u32 = 60;

/// Bits of `word1` that map to real compute units.
pub const HIGH_WORD_VALID: u32 = 0x0fff_ffff;

/// Mask written into every slot at creation: all compute units enabled.
pub const DEFAULT_MASK: (u32, u32) = (0xffff_ffff, HIGH_WORD_VALID);

/// Upper bound on `gpu_count`, guarding against attaching to a region
/// whose leading word is garbage.
pub const MAX_GPUS: u32 = 64;

/// Offset of the `gpu_count` field.
pub const COUNT_OFFSET: usize = 0;

/// Offset of the first mask slot.
pub const SLOTS_OFFSET: usize = COUNT_OFFSET + std::mem::size_of::<u32>();

/// Size of one mask slot in bytes.
pub const SLOT_SIZE: usize = MASK_WORDS * std::mem::size_of::<u32>();

/// Offset of the process-shared lock for a table of `gpu_count` GPUs.
pub fn lock_offset(gpu_count: u32) -> usize {
    SLOTS_OFFSET + gpu_count as usize * SLOT_SIZE
}

/// Total region size for a table of `gpu_count` GPUs.
pub fn region_size(gpu_count: u32) -> usize {
    lock_offset(gpu_count) + std::mem::size_of::<RawTableMutex>()
}

/// Offset of `word` (0 or 1) of the slot for `gpu_index`.
pub fn word_offset(gpu_index: u32, word: usize) -> usize {
    debug_assert!(word < MASK_WORDS);
    SLOTS_OFFSET + gpu_index as usize * SLOT_SIZE + word * std::mem::size_of::<u32>()
}

/// Total number of enabled compute units in a mask pair.
pub fn mask_population(word0: u32, word1: u32) -> u32 {
    word0.count_ones() + word1.count_ones()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn size_math_matches_documented_layout() {
        let lock = std::mem::size_of::<RawTableMutex>();
        assert_eq!(region_size(0), 4 + lock);
        assert_eq!(region_size(1), 4 + 8 + lock);
        assert_eq!(region_size(8), 4 + 8 * 8 + lock);
        assert_eq!(lock_offset(8), 4 + 8 * 8);
    }

    #[test]
    fn word_offsets_are_contiguous() {
        assert_eq!(word_offset(0, 0), 4);
        assert_eq!(word_offset(0, 1), 8);
        assert_eq!(word_offset(2, 0), 4 + 2 * 8);
        assert_eq!(word_offset(2, 1), 4 + 2 * 8 + 4);
    }

    #[test]
    fn default_mask_enables_all_units() {
        let (w0, w1) = DEFAULT_MASK;
        assert_eq!(mask_population(w0, w1), MASK_BITS);
        assert_eq!(w1 & !HIGH_WORD_VALID, 0);
    }

    #[test]
    fn population_counts_both_words() {
        assert_eq!(mask_population(0, 0), 0);
        assert_eq!(mask_population(0xffff_ffff, 0), 32);
        assert_eq!(mask_population(0b1010, 0b0001), 3);
    }
}
