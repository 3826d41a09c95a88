//! UMEM: the page-aligned shared memory region backing every AF_XDP socket's
//! frame pool (spec §3). Frame ownership moves between kernel and user
//! exclusively through the four rings; this module only owns the backing
//! memory and the free-frame bookkeeping on the user side.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

/// byte offset of a frame within a UMEM region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameOffset(pub usize);

/// a frame the caller currently owns: either reserved for RX fill, or held
/// after being read off the RX ring, or prepared for TX.
pub trait Frame {
    fn offset(&self) -> FrameOffset;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// a bare frame handle carrying only its UMEM offset and an intended length,
/// used to hand frames back to the fill ring or forward to the TX ring
/// without a fresh `reserve()`.
#[derive(Debug, Clone, Copy)]
pub struct SliceUmemFrame {
    offset: FrameOffset,
    len: usize,
}

impl SliceUmemFrame {
    pub fn from_offset(offset: FrameOffset, len: usize) -> Self {
        Self { offset, len }
    }
}

impl Frame for SliceUmemFrame {
    fn offset(&self) -> FrameOffset {
        self.offset
    }
    fn len(&self) -> usize {
        self.len
    }
}

/// a contiguous, page-aligned anonymous mapping sized for `frame_count`
/// frames of `frame_size` bytes each.
pub struct PageAlignedMemory {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for PageAlignedMemory {}

impl PageAlignedMemory {
    /// allocate with the system's regular page size.
    pub fn alloc(frame_size: usize, frame_count: usize) -> io::Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        Self::alloc_with_page_size(frame_size, frame_count, page_size, false)
    }

    /// allocate rounding the total size up to `page_size`, optionally
    /// requesting transparent huge pages via `MAP_HUGETLB`. Callers should
    /// fall back to `alloc()` if huge-page allocation fails (huge pages are
    /// frequently unavailable or under-provisioned on a given host).
    pub fn alloc_with_page_size(
        frame_size: usize,
        frame_count: usize,
        page_size: usize,
        huge: bool,
    ) -> io::Result<Self> {
        let total = frame_size
            .checked_mul(frame_count)
            .ok_or_else(|| io::Error::other("frame_size * frame_count overflow"))?;
        let rounded = total.div_ceil(page_size) * page_size;

        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if huge {
            flags |= libc::MAP_HUGETLB;
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                rounded,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len: rounded,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PageAlignedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// the UMEM side of the frame-ownership contract: `reserve`/`release` track
/// which frames are not currently in flight through one of the four rings.
pub trait Umem {
    type Frame: Frame;

    fn reserve(&self) -> Option<Self::Frame>;
    fn release(&self, offset: FrameOffset);
    fn available(&self) -> usize;
    fn as_ptr(&self) -> *const u8;
    fn frame_size(&self) -> u32;
    fn frame_count(&self) -> usize;

    /// borrow `len` bytes starting at `offset` within the region. Caller
    /// must hold exclusive ownership of the frame (RX descriptor just read,
    /// or a frame not yet handed to the kernel) per the single-socket
    /// ownership rule; this is never checked at runtime.
    unsafe fn frame_bytes(&self, offset: FrameOffset, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.as_ptr().add(offset.0), len)
    }

    /// mutably borrow `len` bytes starting at `offset`, for copying a
    /// payload into a frame reserved for TX. Same exclusive-ownership
    /// contract as `frame_bytes`.
    unsafe fn frame_bytes_mut(&self, offset: FrameOffset, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.as_ptr().add(offset.0) as *mut u8, len)
    }
}

/// a `Umem` implementation backed by a bitmap free-list over a
/// `PageAlignedMemory` region, sliced into `frame_size`-byte frames.
///
/// The free list is a lock-free bitmap (one bit per frame, matching the
/// approach used for the example pool allocators in this codebase): `reserve`
/// does a compare-and-swap scan over 64-bit words rather than taking a mutex,
/// since frames are handed to/from the kernel on the hot path.
pub struct SliceUmem<'a> {
    base: *const u8,
    frame_size: u32,
    frame_count: usize,
    // one bit per frame; 1 = free.
    free_mask: Vec<AtomicU64>,
    _memory: std::marker::PhantomData<&'a mut PageAlignedMemory>,
}

unsafe impl Send for SliceUmem<'_> {}
unsafe impl Sync for SliceUmem<'_> {}

impl<'a> SliceUmem<'a> {
    pub fn new(memory: &'a mut PageAlignedMemory, frame_size: u32) -> io::Result<Self> {
        if frame_size == 0 || memory.len() % frame_size as usize != 0 {
            return Err(io::Error::other("frame_size must evenly divide region length"));
        }
        let frame_count = memory.len() / frame_size as usize;
        let words = frame_count.div_ceil(64);
        let mut free_mask = Vec::with_capacity(words);
        for _ in 0..words {
            free_mask.push(AtomicU64::new(u64::MAX));
        }
        // clear any trailing bits beyond frame_count in the last word.
        if frame_count % 64 != 0 {
            let valid_bits = (frame_count % 64) as u32;
            let mask = (1u64 << valid_bits) - 1;
            let last = free_mask.len() - 1;
            free_mask[last].store(mask, Ordering::Relaxed);
        }

        Ok(Self {
            base: memory.as_ptr(),
            frame_size,
            frame_count,
            free_mask,
            _memory: std::marker::PhantomData,
        })
    }
}

impl Umem for SliceUmem<'_> {
    type Frame = SliceUmemFrame;

    fn reserve(&self) -> Option<Self::Frame> {
        for (word_idx, word) in self.free_mask.iter().enumerate() {
            let mut current = word.load(Ordering::Acquire);
            while current != 0 {
                let bit = current.trailing_zeros();
                let candidate = current & !(1u64 << bit);
                match word.compare_exchange_weak(
                    current,
                    candidate,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let frame_index = word_idx * 64 + bit as usize;
                        let offset = FrameOffset(frame_index * self.frame_size as usize);
                        return Some(SliceUmemFrame::from_offset(offset, 0));
                    }
                    Err(observed) => current = observed,
                }
            }
        }
        None
    }

    fn release(&self, offset: FrameOffset) {
        let frame_index = offset.0 / self.frame_size as usize;
        let word_idx = frame_index / 64;
        let bit = frame_index % 64;
        self.free_mask[word_idx].fetch_or(1u64 << bit, Ordering::AcqRel);
    }

    fn available(&self) -> usize {
        self.free_mask
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    fn as_ptr(&self) -> *const u8 {
        self.base
    }

    fn frame_size(&self) -> u32 {
        self.frame_size
    }

    fn frame_count(&self) -> usize {
        self.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_release_conserves_frames() {
        let mut mem = PageAlignedMemory::alloc(4096, 16).unwrap();
        let umem = SliceUmem::new(&mut mem, 4096).unwrap();
        assert_eq!(umem.available(), 16);

        let mut held = vec![];
        while let Some(frame) = umem.reserve() {
            held.push(frame.offset());
        }
        assert_eq!(held.len(), 16);
        assert_eq!(umem.available(), 0);
        assert!(umem.reserve().is_none());

        for offset in held {
            umem.release(offset);
        }
        assert_eq!(umem.available(), 16);
    }

    #[test]
    fn offsets_are_frame_aligned_and_unique() {
        let mut mem = PageAlignedMemory::alloc(4096, 8).unwrap();
        let umem = SliceUmem::new(&mut mem, 4096).unwrap();
        let mut seen = std::collections::HashSet::new();
        while let Some(frame) = umem.reserve() {
            let off = frame.offset();
            assert_eq!(off.0 % 4096, 0);
            assert!(seen.insert(off));
        }
        assert_eq!(seen.len(), 8);
    }
}
