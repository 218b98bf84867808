// Word-wise byte helpers for aligned allocator memory.
//
// Both routines require `ALIGN_SIZE`-aligned destinations (and sources);
// they move whole machine words and finish with a byte tail. The copy is
// overlap-safe in both directions so it can double as a move.

use crate::types::ALIGN_SIZE;

/// Fills `bytes` bytes at `dest` with the repeating 8-byte pattern `data`.
///
/// `dest` must be aligned to `ALIGN_SIZE`.
pub unsafe fn memset_aligned(dest: *mut u8, data: u64, bytes: usize) {
    debug_assert!(dest as usize % ALIGN_SIZE == 0);
    let words = bytes >> 3;
    let mut d = dest as *mut u64;
    for _ in 0..words {
        d.write(data);
        d = d.add(1);
    }
    let mut tail = dest.add(words << 3);
    for i in 0..(bytes & 7) {
        tail.write((data >> (i * 8)) as u8);
        tail = tail.add(1);
    }
}

/// Copies `bytes` bytes from `src` to `dest`, tolerating overlap.
///
/// Both pointers must be aligned to `ALIGN_SIZE`.
pub unsafe fn memcpy_aligned(dest: *mut u8, src: *const u8, bytes: usize) {
    if bytes == 0 || src as usize == dest as usize {
        return;
    }
    debug_assert!(dest as usize % ALIGN_SIZE == 0);
    debug_assert!(src as usize % ALIGN_SIZE == 0);
    let words = bytes >> 3;
    let tail = bytes & 7;
    if src as usize > dest as usize || src as usize + bytes <= dest as usize {
        // forward copy
        let mut d = dest as *mut u64;
        let mut s = src as *const u64;
        for _ in 0..words {
            d.write(s.read());
            d = d.add(1);
            s = s.add(1);
        }
        let d = dest.add(words << 3);
        let s = src.add(words << 3);
        for i in 0..tail {
            d.add(i).write(s.add(i).read());
        }
    } else {
        // destination overlaps the source from above; copy backwards
        let d = dest.add(words << 3);
        let s = src.add(words << 3);
        for i in (0..tail).rev() {
            d.add(i).write(s.add(i).read());
        }
        let d = dest as *mut u64;
        let s = src as *const u64;
        for i in (0..words).rev() {
            d.add(i).write(s.add(i).read());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct Buf([u8; 256]);

    #[test]
    fn memset_fills_words_and_tail() {
        let mut buf = Buf([0xFF; 256]);
        unsafe { memset_aligned(buf.0.as_mut_ptr(), 0, 53) };
        assert!(buf.0[..53].iter().all(|&b| b == 0));
        assert!(buf.0[53..].iter().all(|&b| b == 0xFF));

        let mut buf = Buf([0; 256]);
        unsafe { memset_aligned(buf.0.as_mut_ptr(), 0xA5A5_A5A5_A5A5_A5A5, 64) };
        assert!(buf.0[..64].iter().all(|&b| b == 0xA5));
        assert!(buf.0[64..].iter().all(|&b| b == 0));
    }

    #[test]
    fn copy_disjoint() {
        let mut buf = Buf([0; 256]);
        for (i, b) in buf.0[..64].iter_mut().enumerate() {
            *b = i as u8;
        }
        let base = buf.0.as_mut_ptr();
        unsafe { memcpy_aligned(base.add(128), base, 53) };
        for i in 0..53 {
            assert_eq!(buf.0[128 + i], i as u8);
        }
        assert_eq!(buf.0[128 + 53], 0);
    }

    #[test]
    fn copy_overlapping_forward() {
        // src below dest with overlap forces the backward path
        let mut buf = Buf([0; 256]);
        for (i, b) in buf.0[..64].iter_mut().enumerate() {
            *b = i as u8;
        }
        let base = buf.0.as_mut_ptr();
        unsafe { memcpy_aligned(base.add(16), base, 48) };
        for i in 0..48 {
            assert_eq!(buf.0[16 + i], i as u8);
        }
    }

    #[test]
    fn copy_overlapping_backward() {
        let mut buf = Buf([0; 256]);
        for (i, b) in buf.0[..64].iter_mut().enumerate() {
            *b = i as u8;
        }
        let base = buf.0.as_mut_ptr();
        unsafe { memcpy_aligned(base, base.add(16) as *const u8, 48) };
        for i in 0..48 {
            assert_eq!(buf.0[i], (i + 16) as u8);
        }
    }
}
