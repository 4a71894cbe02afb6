//! Tiny free-lists.
//!
//! Blocks whose body size is below [`MAXTINY`] bypass the splay tree
//! entirely and live on one of [`NTINY`] fixed list heads indexed by
//! [`index`]. Bucket 0 (`TINYSIZE`, the smallest possible body size) is
//! the "tiniest" class: membership is doubly linked, reusing the `LEFT`
//! slot as `TLEFT`, so a specific block can be unlinked in O(1) when
//! `resize` or a merge wants exactly that block back. Every other bucket
//! is singly linked through `LINK`; a specific member is never looked up
//! there, only whole buckets are drained during reclaim.

use crate::block::{self, ALIGN, BODYSIZE, Block};

/// Number of tiny buckets, including the tiniest class at index 0.
pub(crate) const NTINY: usize = 4;

/// The exact body size of bucket 0: the smallest size any free block can
/// ever have, since a body holds at least a link word and a left/right
/// (or self-ref) pair (see [`BODYSIZE`]).
pub(crate) const TINYSIZE: usize = BODYSIZE;

/// Sizes below this go to a tiny bucket instead of the tree.
pub(crate) const MAXTINY: usize = BODYSIZE + NTINY * ALIGN;

/// Bucket index for a body size already known to be `< MAXTINY`.
#[inline]
pub(crate) fn index(size: usize) -> usize {
  debug_assert!(size >= BODYSIZE && size < MAXTINY);
  (size - BODYSIZE) / ALIGN
}

/// The fixed array of tiny-bucket heads owned by a region.
pub(crate) struct TinyLists {
  heads: [Block; NTINY],
}

impl TinyLists {
  pub(crate) const fn new() -> Self {
    Self { heads: [std::ptr::null_mut(); NTINY] }
  }

  /// Prepends `fp` to the bucket matching its own size. Bucket 0 keeps
  /// the doubly-linked tiniest invariant current; the rest are plain
  /// singly-linked pushes.
  pub(crate) fn push(&mut self, fp: Block) {
    let idx = index(block::body_size(fp));
    let old_head = self.heads[idx];
    block::set_link(fp, old_head);
    if idx == 0 {
      block::set_tleft(fp, std::ptr::null_mut());
      if !old_head.is_null() {
        block::set_tleft(old_head, fp);
      }
    }
    self.heads[idx] = fp;
  }

  /// Pops the head of bucket 0, the fast path for a request of exactly
  /// [`TINYSIZE`]. Null if the bucket is empty.
  pub(crate) fn pop_tiniest(&mut self) -> Block {
    let head = self.heads[0];
    if head.is_null() {
      return head;
    }
    let next = block::link(head);
    if !next.is_null() {
      block::set_tleft(next, std::ptr::null_mut());
    }
    self.heads[0] = next;
    head
  }

  /// Removes a known member of bucket 0 in O(1). Callers must already
  /// know `b` is on this bucket; not supported for buckets other than 0,
  /// which are singly linked and only ever drained whole.
  pub(crate) fn remove_tiniest(&mut self, b: Block) {
    let prev = block::tleft(b);
    let next = block::link(b);
    if prev.is_null() {
      debug_assert_eq!(self.heads[0], b);
      self.heads[0] = next;
    } else {
      block::set_link(prev, next);
    }
    if !next.is_null() {
      block::set_tleft(next, prev);
    }
  }

  /// Removes a known member of bucket `idx`. Bucket 0 uses the O(1)
  /// doubly-linked unlink in [`remove_tiniest`](Self::remove_tiniest);
  /// other buckets fall back to a linear scan-and-splice, since per-block
  /// lookup outside the tiniest class isn't an operation these lists
  /// support in O(1) — only the reclaim engine's backward/forward merges
  /// need it, and bucket lengths there stay small in practice.
  pub(crate) fn remove_known(&mut self, idx: usize, b: Block) {
    if idx == 0 {
      self.remove_tiniest(b);
      return;
    }
    let mut prev: Block = std::ptr::null_mut();
    let mut cur = self.heads[idx];
    while !cur.is_null() {
      if cur == b {
        if prev.is_null() {
          self.heads[idx] = block::link(cur);
        } else {
          block::set_link(prev, block::link(cur));
        }
        return;
      }
      prev = cur;
      cur = block::link(cur);
    }
    debug_assert!(false, "remove_known: block not present in its expected tiny bucket");
  }

  /// Drains bucket `idx` whole, returning its head (members stay linked
  /// via `LINK`); the bucket itself is left empty. Used by reclaim to
  /// hand a bucket's contents over to the tree.
  pub(crate) fn drain(&mut self, idx: usize) -> Block {
    std::mem::replace(&mut self.heads[idx], std::ptr::null_mut())
  }

  #[inline]
  pub(crate) fn head(&self, idx: usize) -> Block {
    self.heads[idx]
  }

  #[inline]
  pub(crate) fn is_empty(&self, idx: usize) -> bool {
    self.heads[idx].is_null()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn make_block(size: usize) -> Block {
    let layout = std::alloc::Layout::from_size_align(
      crate::block::HEADSIZE + size,
      crate::block::ALIGN,
    )
    .unwrap();
    let raw = unsafe { std::alloc::alloc_zeroed(layout) };
    let b = raw as Block;
    block::set_size_word(b, size);
    b
  }

  #[test]
  fn index_spans_every_bucket() {
    assert_eq!(index(TINYSIZE), 0);
    assert_eq!(index(TINYSIZE + ALIGN), 1);
    assert_eq!(index(MAXTINY - ALIGN), NTINY - 1);
  }

  #[test]
  fn tiniest_push_pop_is_lifo() {
    let mut lists = TinyLists::new();
    let a = make_block(TINYSIZE);
    let b = make_block(TINYSIZE);
    lists.push(a);
    lists.push(b);
    assert_eq!(lists.pop_tiniest(), b);
    assert_eq!(lists.pop_tiniest(), a);
    assert!(lists.pop_tiniest().is_null());
  }

  #[test]
  fn tiniest_remove_middle_relinks_neighbors() {
    let mut lists = TinyLists::new();
    let a = make_block(TINYSIZE);
    let b = make_block(TINYSIZE);
    let c = make_block(TINYSIZE);
    lists.push(a);
    lists.push(b);
    lists.push(c);
    lists.remove_tiniest(b);
    assert_eq!(lists.pop_tiniest(), c);
    assert_eq!(lists.pop_tiniest(), a);
    assert!(lists.pop_tiniest().is_null());
  }

  #[test]
  fn remove_known_splices_non_tiniest_bucket() {
    let mut lists = TinyLists::new();
    let a = make_block(TINYSIZE + ALIGN);
    let b = make_block(TINYSIZE + ALIGN);
    let c = make_block(TINYSIZE + ALIGN);
    lists.push(a);
    lists.push(b);
    lists.push(c);
    lists.remove_known(1, b);
    let head = lists.drain(1);
    assert_eq!(head, c);
    assert_eq!(block::link(head), a);
  }

  #[test]
  fn drain_empties_bucket_and_preserves_chain() {
    let mut lists = TinyLists::new();
    let a = make_block(TINYSIZE + ALIGN);
    let b = make_block(TINYSIZE + ALIGN);
    lists.push(a);
    lists.push(b);
    let head = lists.drain(1);
    assert_eq!(head, b);
    assert_eq!(block::link(head), a);
    assert!(lists.is_empty(1));
  }
}
