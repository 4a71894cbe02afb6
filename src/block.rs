//! Block layout and bit-tag primitives.
//!
//! A block is a header followed by a body. The header is two machine
//! words: a size word whose low 4 bits carry tags and whose remaining
//! bits carry the body size (a multiple of [`ALIGN`]), and a segment
//! back-pointer word shared physically by busy and free blocks.
//!
//! The body of a *free* block is, in order, a link word, a left-child
//! word, a right-child word, and — at the last machine word of the
//! body — a self-reference pointer (invariant 3). The minimum body
//! size, [`BODYSIZE`], is exactly four words so that a tree node never
//! has to share a slot between two roles.
//!
//! Blocks are walked through raw pointers rather than typed references:
//! the same bytes are read as a tiny-list node, a tree node, or a
//! sentinel depending on where they currently live, which safe `&`/`&mut`
//! aliasing cannot express. This mirrors how the intrusive free-list
//! allocators in the wild walk block chains.

use std::mem;
use std::ptr;

use crate::segment::Segment;

/// Word size of the target, used as the pointer stride within a body.
pub(crate) const WORD: usize = mem::size_of::<usize>();

/// Block size granule. Chosen as 16 so that 4 low bits of the size word
/// are free for tags (`BUSY`, `PFREE`, `JUNK`, `LINK`) regardless of
/// whether the target is 32- or 64-bit, and so it evenly divides
/// [`HEADSIZE`] and [`BODYSIZE`].
pub(crate) const ALIGN: usize = 16;

/// Block is allocated (or is the zero-size sentinel).
pub(crate) const BUSY: usize = 1 << 0;
/// The block physically preceding this one is free.
pub(crate) const PFREE: usize = 1 << 1;
/// The block is free-in-intent but not yet reclaimed into the tree.
pub(crate) const JUNK: usize = 1 << 2;
/// Marks a free-tree node as the head of an equal-size chain: its
/// `LEFT`/`RIGHT` are tree children, and non-head chain members carry
/// this bit set but are *not* tree-navigable. A free block's three tag
/// bits (`BUSY|PFREE|JUNK`) are always zero, so this bit safely reuses
/// the otherwise-idle 4th low bit rather than needing a 5th header word.
pub(crate) const LINK: usize = 1 << 3;

/// The three tags invariant 1 requires to be clear on every free block.
pub(crate) const TAGS: usize = BUSY | PFREE | JUNK;
/// Mask covering tags and the link bit; clearing this yields body size.
const SIZE_MASK: usize = !(ALIGN - 1);

/// Header size: the size word plus the segment back-pointer word.
pub(crate) const HEADSIZE: usize = 2 * WORD;
/// Minimum body size: link + left + right + self, one word each.
pub(crate) const BODYSIZE: usize = 4 * WORD;

/// Pointer to a block header. Never read through a typed reference for
/// the size/seg words from outside this module — external callers
/// always go through the accessor functions below, so the "uniform
/// header access is a byte-level read" design note holds even as
/// callers vary the interpretation of the body.
#[repr(C)]
pub(crate) struct Head {
  size: usize,
  seg: *mut Segment,
}

pub(crate) type Block = *mut Head;

#[inline]
pub(crate) fn body_size(b: Block) -> usize {
  unsafe { (*b).size & SIZE_MASK }
}

#[inline]
pub(crate) fn raw_size_word(b: Block) -> usize {
  unsafe { (*b).size }
}

#[inline]
pub(crate) fn set_size(b: Block, size: usize) {
  debug_assert_eq!(size & !SIZE_MASK, 0, "block body size must be ALIGN-rounded");
  unsafe { (*b).size = size | ((*b).size & !SIZE_MASK) };
}

/// Overwrites the full size word, tags included. Used when splitting or
/// initializing a block from scratch.
#[inline]
pub(crate) fn set_size_word(b: Block, word: usize) {
  unsafe { (*b).size = word };
}

#[inline]
pub(crate) fn is_busy(b: Block) -> bool {
  unsafe { (*b).size & BUSY != 0 }
}

#[inline]
pub(crate) fn is_pfree(b: Block) -> bool {
  unsafe { (*b).size & PFREE != 0 }
}

#[inline]
pub(crate) fn is_junk(b: Block) -> bool {
  unsafe { (*b).size & JUNK != 0 }
}

#[inline]
pub(crate) fn is_link(b: Block) -> bool {
  unsafe { (*b).size & LINK != 0 }
}

#[inline]
pub(crate) fn set_busy(b: Block) {
  unsafe { (*b).size |= BUSY };
}

#[inline]
pub(crate) fn clear_busy(b: Block) {
  unsafe { (*b).size &= !BUSY };
}

#[inline]
pub(crate) fn set_pfree(b: Block) {
  unsafe { (*b).size |= PFREE };
}

#[inline]
pub(crate) fn clear_pfree(b: Block) {
  unsafe { (*b).size &= !PFREE };
}

#[inline]
pub(crate) fn set_junk(b: Block) {
  unsafe { (*b).size |= JUNK };
}

#[inline]
pub(crate) fn clear_junk(b: Block) {
  unsafe { (*b).size &= !JUNK };
}

#[inline]
pub(crate) fn set_link_bit(b: Block) {
  unsafe { (*b).size |= LINK };
}

#[inline]
pub(crate) fn clear_link_bit(b: Block) {
  unsafe { (*b).size &= !LINK };
}

/// Clears `BUSY|PFREE|JUNK` (but not `LINK`), as the source's `CLRBITS`
/// does when a block transitions into being a plain free block.
#[inline]
pub(crate) fn clear_tags(b: Block) {
  unsafe { (*b).size &= !TAGS };
}

#[inline]
pub(crate) fn seg(b: Block) -> *mut Segment {
  unsafe { (*b).seg }
}

#[inline]
pub(crate) fn set_seg(b: Block, s: *mut Segment) {
  unsafe { (*b).seg = s };
}

/// Address of the first body byte (what `alloc`/`resize`/`align` return
/// to callers).
#[inline]
pub(crate) fn data(b: Block) -> *mut u8 {
  unsafe { (b as *mut u8).add(HEADSIZE) }
}

/// Recovers the block header from a body address previously returned to
/// a caller.
#[inline]
pub(crate) fn block_of(data: *mut u8) -> Block {
  unsafe { data.sub(HEADSIZE) as Block }
}

/// The block physically following `b` (valid for both busy and free
/// blocks — this is how the sentinel is reached by forward walking).
#[inline]
pub(crate) fn next_physical(b: Block) -> Block {
  unsafe { data(b).add(body_size(b)) as Block }
}

/// The block physically preceding `b`, valid only when `PFREE(b)` is
/// set: reads the self-reference word the preceding free block wrote at
/// the last word of its own body, which sits immediately before `b`'s
/// header.
#[inline]
pub(crate) fn last_physical(b: Block) -> Block {
  unsafe { *((b as *mut Block).sub(1)) }
}

#[inline]
fn body_word(b: Block, index: usize) -> *mut Block {
  unsafe { (data(b) as *mut Block).add(index) }
}

/// Word 0 of the body: the singly-linked list / equal-size chain link.
#[inline]
pub(crate) fn link(b: Block) -> Block {
  unsafe { *body_word(b, 0) }
}

#[inline]
pub(crate) fn set_link(b: Block, v: Block) {
  unsafe { *body_word(b, 0) = v };
}

/// Word 1 of the body: the tree left child (non-tiniest free blocks).
#[inline]
pub(crate) fn left(b: Block) -> Block {
  unsafe { *body_word(b, 1) }
}

#[inline]
pub(crate) fn set_left(b: Block, v: Block) {
  unsafe { *body_word(b, 1) = v };
}

/// Word 1 of the body, reinterpreted as the tiniest class's doubly
/// linked back pointer (`TLEFT`). Physically the same slot as `left`.
#[inline]
pub(crate) fn tleft(b: Block) -> Block {
  left(b)
}

#[inline]
pub(crate) fn set_tleft(b: Block, v: Block) {
  set_left(b, v);
}

/// Word 2 of the body: the tree right child.
#[inline]
pub(crate) fn right(b: Block) -> Block {
  unsafe { *body_word(b, 2) }
}

#[inline]
pub(crate) fn set_right(b: Block, v: Block) {
  unsafe { *body_word(b, 2) = v };
}

/// Reads the self-reference word at the last machine word of `b`'s
/// body (invariant 3: must equal `b` for every free block).
#[inline]
pub(crate) fn self_ref(b: Block) -> Block {
  unsafe { ptr::read_unaligned(self_ref_slot(b)) }
}

/// Writes the self-reference word at the tail of `b`'s body.
#[inline]
pub(crate) fn set_self_ref(b: Block) {
  unsafe { ptr::write_unaligned(self_ref_slot(b), b) };
}

#[inline]
fn self_ref_slot(b: Block) -> *mut Block {
  let size = body_size(b);
  debug_assert!(size >= BODYSIZE);
  unsafe { data(b).add(size - WORD) as *mut Block }
}

/// Rounds a requested allocation size up to at least [`BODYSIZE`] and to
/// an [`ALIGN`] multiple. A request of `0` still rounds up to `BODYSIZE`
/// so `alloc(0)` returns a distinct, freeable, non-null pointer.
#[inline]
pub(crate) fn round_request(size: usize) -> usize {
  if size <= BODYSIZE {
    BODYSIZE
  } else {
    crate::align::align_up(size, ALIGN)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_request_floors_at_bodysize() {
    assert_eq!(round_request(0), BODYSIZE);
    assert_eq!(round_request(1), BODYSIZE);
    assert_eq!(round_request(BODYSIZE), BODYSIZE);
  }

  #[test]
  fn round_request_rounds_up_to_align() {
    assert_eq!(round_request(BODYSIZE + 1), BODYSIZE + ALIGN);
    assert_eq!(round_request(BODYSIZE + ALIGN), BODYSIZE + ALIGN);
  }

  #[test]
  fn header_and_body_divide_by_align() {
    assert_eq!(HEADSIZE % ALIGN, 0);
    assert_eq!(BODYSIZE % ALIGN, 0);
  }
}
