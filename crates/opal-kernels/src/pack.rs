//! Bit-packing kernels for the affine quantization codec.
//!
//! Quantization codes are fixed-width unsigned integers (2, 4, or 8
//! bits); `32 / bits` consecutive codes share one little-endian 32-bit
//! word: `word = sum(code_i << (i * bits))`.

/// Number of codes stored per 32-bit word.
pub fn codes_per_word(bits: u32) -> usize {
    (32 / bits) as usize
}

/// Pack a run of codes into 32-bit words.
///
/// `codes.len()` must be a multiple of `32 / bits`; each code must fit
/// in `bits` bits (callers clip before packing).
pub fn pack_codes(codes: &[u32], bits: u32) -> Vec<u32> {
    let per_word = codes_per_word(bits);
    debug_assert_eq!(codes.len() % per_word, 0);

    let mut words = Vec::with_capacity(codes.len() / per_word);
    for chunk in codes.chunks_exact(per_word) {
        let mut word = 0u32;
        for (i, &code) in chunk.iter().enumerate() {
            word |= code << (i as u32 * bits);
        }
        words.push(word);
    }
    words
}

/// Unpack 32-bit words back into codes by shift-and-mask.
pub fn unpack_words(words: &[u32], bits: u32) -> Vec<u32> {
    let per_word = codes_per_word(bits);
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };

    let mut codes = Vec::with_capacity(words.len() * per_word);
    for &word in words {
        for i in 0..per_word {
            codes.push((word >> (i as u32 * bits)) & mask);
        }
    }
    codes
}
