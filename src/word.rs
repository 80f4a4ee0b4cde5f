//! The header/footer word codec.
//!
//! Every block carries a 4-byte word immediately below its payload (and,
//! outside the buddy variant, a mirror of it at the block's end) packing the
//! block size together with the allocated bit. Sizes are always multiples of
//! 8, so the low three bits are free to carry state.

/// Size of a heap word, and of a header or footer, in bytes.
pub(crate) const WSIZE: u32 = 4;

/// Size of a double word in bytes; also the payload alignment.
pub(crate) const DSIZE: u32 = 8;

/// Smallest representable block: header, two link words, footer.
pub(crate) const MIN_BLOCK: u32 = 16;

/// Default heap extension quantum in bytes.
pub(crate) const CHUNKSIZE: u32 = 4096;

/// Packs a block size and an allocated bit into one tag word.
#[inline]
pub(crate) fn pack(size: u32, alloc: bool) -> u32 {
    debug_assert_eq!(size & 0x7, 0);
    size | alloc as u32
}

/// Extracts the block size from a tag word.
#[inline]
pub(crate) fn unpacked_size(word: u32) -> u32 {
    word & !0x7
}

/// Extracts the allocated bit from a tag word.
#[inline]
pub(crate) fn is_alloc(word: u32) -> bool {
    word & 0x1 != 0
}

/// Adjusted block size for a non-buddy request: payload plus header and
/// footer, rounded up to 8 bytes, at least [`MIN_BLOCK`].
///
/// Returns `None` if the adjusted size does not fit a tag word.
#[inline]
pub(crate) fn padded_request(size: usize) -> Option<u32> {
    let size = u32::try_from(size).ok()?;

    if size <= DSIZE {
        Some(MIN_BLOCK)
    } else {
        let padded = size.checked_add(DSIZE + (DSIZE - 1))? & !(DSIZE - 1);
        Some(padded)
    }
}

/// Adjusted block size for a buddy request: the smallest power of two that
/// holds the payload plus a double word of overhead, at least [`MIN_BLOCK`].
///
/// Returns `None` if the adjusted size does not fit a tag word.
#[inline]
pub(crate) fn padded_pow2_request(size: usize) -> Option<u32> {
    let need = u32::try_from(size).ok()?.checked_add(DSIZE)?;
    let padded = need.checked_next_power_of_two()?;
    Some(padded.max(MIN_BLOCK))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for size in [0u32, 8, 16, 4096, 1 << 20] {
            for alloc in [false, true] {
                let word = pack(size, alloc);
                assert_eq!(unpacked_size(word), size);
                assert_eq!(is_alloc(word), alloc);
            }
        }
    }

    #[test]
    fn request_padding() {
        assert_eq!(padded_request(0), Some(MIN_BLOCK));
        assert_eq!(padded_request(1), Some(MIN_BLOCK));
        assert_eq!(padded_request(8), Some(MIN_BLOCK));
        assert_eq!(padded_request(9), Some(24));
        assert_eq!(padded_request(16), Some(24));
        assert_eq!(padded_request(2040), Some(2048));
        assert_eq!(padded_request(usize::MAX), None);
    }

    #[test]
    fn pow2_request_padding() {
        assert_eq!(padded_pow2_request(1), Some(16));
        assert_eq!(padded_pow2_request(8), Some(16));
        assert_eq!(padded_pow2_request(9), Some(32));
        assert_eq!(padded_pow2_request(100), Some(128));
        assert_eq!(padded_pow2_request(120), Some(128));
        assert_eq!(padded_pow2_request(121), Some(256));
        assert_eq!(padded_pow2_request(usize::MAX), None);
    }
}
