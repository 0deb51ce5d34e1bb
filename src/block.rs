use std::ptr::NonNull;

/// Size in bytes of one boundary-tag word.
pub(crate) const WSIZE: usize = 4;

/// Size in bytes of a double word. Every block size is a multiple of this.
pub(crate) const DSIZE: usize = 8;

/// Alignment guaranteed for every payload pointer we hand out.
pub const ALIGNMENT: usize = DSIZE;

/// Bytes of metadata carried by every block (header word plus footer word).
pub(crate) const OVERHEAD: usize = 2 * WSIZE;

/// Smallest block we ever create. Two tag words plus enough payload to hold
/// the two free-list link words while the block sits on a free list.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

/// A free-list link word holding this value points at nothing. Offset zero
/// is the pad word at the base of the heap, which is never a payload.
pub(crate) const NO_LINK: u32 = 0;

/// A view over one block of heap memory, identified by its payload pointer.
///
/// Every block is a contiguous span of heap bytes with a one word header, a
/// payload and a one word footer. Header and footer both pack the block size
/// together with an allocated bit, so the layout looks like this:
///
/// ```text
/// +---------------------+ <- header word: size | allocated bit
/// |       header        |
/// +---------------------+ <- payload pointer (what `Block` holds)
/// |       Payload       |
/// |         ...         |
/// |         ...         |
/// +---------------------+ <- footer word: copy of the header
/// |       footer        |
/// +---------------------+
/// ```
///
/// The size stored in the tags covers the whole span including both tag
/// words. Keeping a copy of the tag at both ends is what lets us step to the
/// previous block in O(1): its footer sits right below our header.
///
/// While a block is free, the first two payload words are repurposed as the
/// predecessor and successor links of its free-list bucket. Links are stored
/// as byte offsets of the linked payload from the heap base, because a raw
/// pointer would not fit the 4 byte link word of a minimum-size block.
///
/// `Block` itself is pure address arithmetic. It owns nothing and checks
/// nothing. Callers must only construct it from addresses that really are
/// block payloads inside the managed region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(NonNull<u8>);

/// Packs a block size and an allocated flag into one tag word.
/// The size is a multiple of [`ALIGNMENT`], so its low bits are free.
#[inline]
fn pack(size: usize, allocated: bool) -> u32 {
    size as u32 | allocated as u32
}

impl Block {
    /// Builds a view from a payload pointer.
    #[inline]
    pub fn from_payload(payload: NonNull<u8>) -> Self {
        Self(payload)
    }

    /// Builds a view from the byte offset of a payload relative to `base`.
    ///
    /// **SAFETY**: `offset` must be a payload offset previously produced by
    /// [`Block::offset_from`] for a block that still exists.
    #[inline]
    pub unsafe fn at_offset(base: NonNull<u8>, offset: u32) -> Self {
        unsafe { Self(NonNull::new_unchecked(base.as_ptr().add(offset as usize))) }
    }

    /// Payload pointer of this block. This is the address handed to callers.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        self.0
    }

    /// Byte offset of this block's payload from the heap base.
    #[inline]
    pub fn offset_from(self, base: NonNull<u8>) -> u32 {
        (self.0.as_ptr() as usize - base.as_ptr() as usize) as u32
    }

    /// Address of the header word, immediately below the payload.
    #[inline]
    fn header(self) -> *mut u32 {
        unsafe { self.0.as_ptr().sub(WSIZE).cast() }
    }

    /// Size of the block, tag words included.
    #[inline]
    pub unsafe fn size(self) -> usize {
        unsafe { (self.header().read() & !(ALIGNMENT as u32 - 1)) as usize }
    }

    /// Whether the block is currently free.
    #[inline]
    pub unsafe fn is_free(self) -> bool {
        unsafe { self.header().read() & 0x1 == 0 }
    }

    /// Writes the header word only. Used for the epilogue, which is a bare
    /// header with no payload or footer behind it.
    #[inline]
    pub unsafe fn write_header(self, size: usize, allocated: bool) {
        unsafe { self.header().write(pack(size, allocated)) }
    }

    /// Writes matching header and footer tags for a block of `size` bytes.
    /// The footer position is derived from the new size, not the old tags.
    pub unsafe fn write_tags(self, size: usize, allocated: bool) {
        unsafe {
            self.header().write(pack(size, allocated));
            let footer: *mut u32 = self.0.as_ptr().add(size - DSIZE).cast();
            footer.write(pack(size, allocated));
        }
    }

    /// The block physically after this one. Only meaningful while this block
    /// is not the epilogue.
    #[inline]
    pub unsafe fn next(self) -> Block {
        unsafe { Self(NonNull::new_unchecked(self.0.as_ptr().add(self.size()))) }
    }

    /// The block physically before this one, located through its footer.
    /// Only meaningful while this block is not the prologue.
    #[inline]
    pub unsafe fn prev(self) -> Block {
        unsafe {
            let prev_footer: *mut u32 = self.0.as_ptr().sub(DSIZE).cast();
            let prev_size = (prev_footer.read() & !(ALIGNMENT as u32 - 1)) as usize;
            Self(NonNull::new_unchecked(self.0.as_ptr().sub(prev_size)))
        }
    }

    /// Whether the physically preceding block is free, read straight from
    /// its footer without materializing the block.
    #[inline]
    pub unsafe fn prev_is_free(self) -> bool {
        unsafe {
            let prev_footer: *mut u32 = self.0.as_ptr().sub(DSIZE).cast();
            prev_footer.read() & 0x1 == 0
        }
    }

    // Free-list link words. Only valid while the block is free: the same
    // bytes are caller payload while the block is allocated.

    /// Offset of the free-list predecessor, or [`NO_LINK`].
    #[inline]
    pub unsafe fn pred(self) -> u32 {
        unsafe { self.0.as_ptr().cast::<u32>().read() }
    }

    /// Offset of the free-list successor, or [`NO_LINK`].
    #[inline]
    pub unsafe fn succ(self) -> u32 {
        unsafe { self.0.as_ptr().add(WSIZE).cast::<u32>().read() }
    }

    #[inline]
    pub unsafe fn set_pred(self, offset: u32) {
        unsafe { self.0.as_ptr().cast::<u32>().write(offset) }
    }

    #[inline]
    pub unsafe fn set_succ(self, offset: u32) {
        unsafe { self.0.as_ptr().add(WSIZE).cast::<u32>().write(offset) }
    }
}
