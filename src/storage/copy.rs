//! Masked extraction kernels moving page-resident values into the scan's
//! tuple buffer.
//!
//! `src_offsets` selects indices of the dense (non-null) source array,
//! `dst_offsets` the destination slots; both have equal popcount. All
//! destination slots up to `num_tuples` that receive no value are set to
//! the null marker.

use crate::common::bits::{bits_to_offsets, dense_range, is_dense, OFFSET_BUFFER};
use crate::common::NULL_VALUE;
use crate::storage::string_ptr::StringPtr;

#[inline]
unsafe fn fill_null(dst: *mut u64, from: usize, to: usize) {
    for i in from..to {
        *dst.add(i) = NULL_VALUE;
    }
}

unsafe fn extract_impl(
    dst: *mut u64,
    src_offsets: u64,
    dst_offsets: u64,
    num_tuples: usize,
    compute: impl Fn(usize) -> u64,
) {
    if num_tuples == 0 {
        return;
    }

    // Fast path: at most one value to move.
    if src_offsets & src_offsets.wrapping_sub(1) == 0 {
        fill_null(dst, 0, num_tuples);
        if src_offsets != 0 {
            debug_assert_eq!(dst_offsets.count_ones(), 1);
            let src_pos = src_offsets.trailing_zeros() as usize;
            let dst_pos = dst_offsets.trailing_zeros() as usize;
            *dst.add(dst_pos) = compute(src_pos);
        }
        return;
    }
    // Fast path: everything selected.
    if src_offsets == u64::MAX {
        debug_assert_eq!(dst_offsets, u64::MAX);
        debug_assert_eq!(num_tuples, 64);
        for i in 0..64 {
            *dst.add(i) = compute(i);
        }
        return;
    }

    debug_assert_eq!(src_offsets.count_ones(), dst_offsets.count_ones());

    let src_dense = is_dense(src_offsets);
    let dst_dense = is_dense(dst_offsets);

    if dst_dense {
        let (dst_start, dst_end) = dense_range(dst_offsets);
        fill_null(dst, 0, dst_start);
        if src_dense {
            let (src_start, _) = dense_range(src_offsets);
            for i in 0..dst_end - dst_start {
                *dst.add(dst_start + i) = compute(src_start + i);
            }
        } else {
            let mut src_buffer = [0u8; OFFSET_BUFFER];
            let n = bits_to_offsets(&mut src_buffer, src_offsets);
            for (i, &src_pos) in src_buffer[..n].iter().enumerate() {
                *dst.add(dst_start + i) = compute(src_pos as usize);
            }
        }
        fill_null(dst, dst_end, num_tuples);
        return;
    }

    fill_null(dst, 0, num_tuples);
    let mut dst_buffer = [0u8; OFFSET_BUFFER];
    let dst_count = bits_to_offsets(&mut dst_buffer, dst_offsets);
    if src_dense {
        let (src_start, _) = dense_range(src_offsets);
        for (i, &dst_pos) in dst_buffer[..dst_count].iter().enumerate() {
            *dst.add(dst_pos as usize) = compute(src_start + i);
        }
    } else {
        let mut src_buffer = [0u8; OFFSET_BUFFER];
        let src_count = bits_to_offsets(&mut src_buffer, src_offsets);
        debug_assert_eq!(src_count, dst_count);
        for i in 0..src_count {
            *dst.add(dst_buffer[i] as usize) = compute(src_buffer[i] as usize);
        }
    }
}

/// # Safety
/// `dst` must hold `num_tuples` slots; `src` must cover every selected
/// index.
pub unsafe fn extract_int32(
    dst: *mut u64,
    src: *const u32,
    src_offsets: u64,
    dst_offsets: u64,
    num_tuples: usize,
) {
    extract_impl(dst, src_offsets, dst_offsets, num_tuples, |i| {
        src.add(i).read_unaligned() as u64
    });
}

/// # Safety
/// `dst` must hold `num_tuples` slots; `src` must cover every selected
/// index.
pub unsafe fn extract_int64(
    dst: *mut u64,
    src: *const u64,
    src_offsets: u64,
    dst_offsets: u64,
    num_tuples: usize,
) {
    extract_impl(dst, src_offsets, dst_offsets, num_tuples, |i| src.add(i).read_unaligned());
}

/// Short-string extraction: `src` is the cumulative offset table, and each
/// value becomes a packed string pointer into `string_head`. Selected
/// indices must be > 0 (the page-leading string is handled by the caller,
/// whose offset has no predecessor).
///
/// # Safety
/// As above; `string_head` must point at the page's string region.
pub unsafe fn extract_varchar(
    dst: *mut u64,
    src: *const u16,
    src_offsets: u64,
    dst_offsets: u64,
    num_tuples: usize,
    string_head: *const u8,
) {
    extract_impl(dst, src_offsets, dst_offsets, num_tuples, |i| {
        let offset = src.add(i).read_unaligned() as usize;
        let prev = src.add(i - 1).read_unaligned() as usize;
        debug_assert!(prev <= offset);
        StringPtr::from_short(string_head.add(prev), offset - prev).as_bits()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::is_null;

    #[test]
    fn test_extract_single_value() {
        let src: Vec<u32> = vec![10, 20, 30];
        let mut dst = [0u64; 4];
        unsafe {
            extract_int32(dst.as_mut_ptr(), src.as_ptr(), 0b100, 0b0010, 4);
        }
        assert!(is_null(dst[0]));
        assert_eq!(dst[1], 30);
        assert!(is_null(dst[2]));
        assert!(is_null(dst[3]));
    }

    #[test]
    fn test_extract_dense_run() {
        let src: Vec<u32> = (0..8).collect();
        let mut dst = [0u64; 8];
        // Source rows 2..6 land in destination slots 1..5.
        unsafe {
            extract_int32(dst.as_mut_ptr(), src.as_ptr(), 0b0011_1100, 0b0001_1110, 8);
        }
        assert!(is_null(dst[0]));
        assert_eq!(&dst[1..5], &[2, 3, 4, 5]);
        assert!(is_null(dst[5]));
    }

    #[test]
    fn test_extract_sparse_to_sparse() {
        let src: Vec<u64> = vec![100, 200, 300, 400];
        let mut dst = [0u64; 8];
        unsafe {
            extract_int64(dst.as_mut_ptr(), src.as_ptr(), 0b1010, 0b0101_0000, 8);
        }
        assert_eq!(dst[4], 200);
        assert_eq!(dst[6], 400);
        for i in [0usize, 1, 2, 3, 5, 7] {
            assert!(is_null(dst[i]), "slot {i}");
        }
    }

    #[test]
    fn test_extract_all_64() {
        let src: Vec<u32> = (0..64).collect();
        let mut dst = [0u64; 64];
        unsafe {
            extract_int32(dst.as_mut_ptr(), src.as_ptr(), u64::MAX, u64::MAX, 64);
        }
        for (i, &v) in dst.iter().enumerate() {
            assert_eq!(v, i as u64);
        }
    }

    #[test]
    fn test_extract_varchar_offsets() {
        // Offset table for strings "ab", "cde" starting after a leading "x".
        let offsets: Vec<u16> = vec![1, 3, 6];
        let bytes = b"xabcde";
        let mut dst = [0u64; 2];
        unsafe {
            extract_varchar(dst.as_mut_ptr(), offsets.as_ptr(), 0b110, 0b11, 2, bytes.as_ptr());
        }
        let first = StringPtr::from_bits(dst[0]);
        let second = StringPtr::from_bits(dst[1]);
        assert_eq!(first.short_bytes(), b"ab");
        assert_eq!(second.short_bytes(), b"cde");
    }
}
