//! Parity checksum over an artifact image.
//!
//! The image is read as native-endian 32-bit words and XORed together; a tail
//! shorter than a word is zero-padded. Storing the parity and XORing it back
//! in during validation gives zero for an intact image. This catches torn
//! writes and bit rot, not deliberate tampering.

const WORD: usize = 4;

/// XOR of every 32-bit word of `bytes`.
pub fn parity(bytes: &[u8]) -> u32 {
    let mut chunks = bytes.chunks_exact(WORD);
    let mut acc = 0u32;
    for chunk in &mut chunks {
        acc ^= u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut word = [0u8; WORD];
        word[..tail.len()].copy_from_slice(tail);
        acc ^= u32::from_ne_bytes(word);
    }
    acc
}

/// Whether `bytes` matches a previously stored parity.
pub fn verify(bytes: &[u8], stored: u32) -> bool {
    parity(bytes) ^ stored == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(parity(&[]), 0);
    }

    #[test]
    fn zero_image_is_zero() {
        assert_eq!(parity(&[0u8; 4096]), 0);
    }

    #[test]
    fn identical_words_cancel() {
        let bytes = [1, 2, 3, 4, 1, 2, 3, 4];
        assert_eq!(parity(&bytes), 0);
    }

    #[test]
    fn tail_is_zero_padded() {
        assert_eq!(parity(&[0xAB]), u32::from_ne_bytes([0xAB, 0, 0, 0]));
    }

    #[test]
    fn single_bit_flip_is_detected() {
        let mut image: Vec<u8> = (0..=255u8).cycle().take(8192).collect();
        let stored = parity(&image);
        assert!(verify(&image, stored));
        image[5000] ^= 0x10;
        assert!(!verify(&image, stored));
    }
}
