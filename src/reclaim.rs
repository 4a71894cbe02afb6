//! Reclaim/coalesce engine: turns the cache's deferred frees into
//! fully merged free blocks filed back on a tiny list, the tree, or the
//! wilderness slot.
//!
//! `reclaim` scans the cache from bucket `S_CACHE` down to `low_bucket`.
//! Because a forward merge can absorb a block that is itself cached in
//! an as-yet-unvisited bucket, the engine lowers its own terminal bucket
//! mid-scan (marking the absorbed block's size `0` so the later visit to
//! its original bucket is a no-op) rather than restarting — each cache
//! list is still touched at most once per call.

use crate::block::{self, Block, HEADSIZE};
use crate::cache::{self, ReclaimCache};
use crate::segment::{self, Segment};
use crate::tiny::{self, TinyLists};
use crate::tree;

/// Drains and coalesces the cache down through `low_bucket`. If `wanted`
/// is non-null, returns whether that exact block was seen emerge from a
/// merge (it is left busy, reserved for the caller, rather than filed
/// onto a list).
pub(crate) fn reclaim(
  root: &mut Block,
  tiny: &mut TinyLists,
  cache: &mut ReclaimCache,
  wilderness: &mut Block,
  bottom: *mut Segment,
  wanted: Block,
  low_bucket: usize,
) -> bool {
  let last = cache.take_last_freed();
  if !last.is_null() {
    cache.push(cache::S_CACHE, last);
  }

  let mut saw_wanted = wanted.is_null();
  let mut low = low_bucket as isize;
  let mut n = cache::S_CACHE as isize;
  while n >= low {
    let mut list = cache.drain(n as usize);
    while !list.is_null() {
      let fp0 = list;
      list = block::link(list);

      if !block::is_junk(fp0) {
        // A forward merge earlier in this same pass already absorbed it.
        continue;
      }

      let mut fp = fp0;
      let mut size;
      if block::is_pfree(fp0) {
        let prev = block::last_physical(fp0);
        let prev_size = block::body_size(prev);
        remove_known(root, tiny, prev_size, prev);
        size = block::body_size(fp0) + prev_size + HEADSIZE;
        fp = prev;
      } else {
        size = block::body_size(fp0);
      }

      loop {
        let np = unsafe { block::data(fp).add(size) as Block };
        if !block::is_busy(np) {
          if np == *wilderness {
            *wilderness = std::ptr::null_mut();
          } else {
            remove_known(root, tiny, block::body_size(np), np);
          }
          size += block::body_size(np) + HEADSIZE;
        } else if block::is_junk(np) {
          let idx = cache::index(block::body_size(np)) as isize;
          if idx < low {
            low = idx;
          }
          size += block::body_size(np) + HEADSIZE;
          block::set_size_word(np, 0);
        } else {
          break;
        }
      }

      block::set_size_word(fp, size);

      let next = block::next_physical(fp);
      debug_assert!(block::is_busy(next) && !block::is_junk(next));
      block::set_pfree(next);
      block::set_self_ref(fp);

      if fp == wanted {
        debug_assert!(!saw_wanted, "reclaim must see `wanted` at most once");
        saw_wanted = true;
        continue;
      }

      if segment::is_wilderness_candidate(bottom, fp) {
        *wilderness = fp;
        continue;
      }

      if size < tiny::MAXTINY {
        tiny.push(fp);
      } else {
        tree::insert(root, fp);
      }
    }
  }

  saw_wanted
}

/// Removes a block of known `size` from wherever its size class lives:
/// a tiny bucket, or the tree. A block's size alone determines its home,
/// so there is no ambiguity to resolve here.
fn remove_known(root: &mut Block, tiny: &mut TinyLists, size: usize, target: Block) {
  if size < tiny::MAXTINY {
    tiny.remove_known(tiny::index(size), target);
  } else {
    tree::remove_known(root, size, target);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::alloc::Layout;

  /// A tiny single-segment arena for exercising reclaim in isolation:
  /// `[block A][block B][sentinel]`, all laid out by hand so physical
  /// adjacency (`next_physical`/`last_physical`) holds.
  struct Arena {
    _buf: Box<[u8]>,
    base: *mut u8,
  }

  impl Arena {
    fn new(len: usize) -> Self {
      let layout = Layout::from_size_align(len, block::ALIGN).unwrap();
      let mut buf = vec![0u8; len].into_boxed_slice();
      let base = buf.as_mut_ptr();
      Self { _buf: buf, base }
    }

    fn block_at(&self, offset: usize) -> Block {
      unsafe { self.base.add(offset) as Block }
    }
  }

  #[test]
  fn backward_and_forward_merge_into_single_free_block() {
    // Three adjacent bodies of TINYSIZE each, the middle one junk+PFREE
    // (predecessor free, already-free successor pending in the cache
    // catch-all), the tail busy to stop the forward merge.
    let body = tiny::TINYSIZE;
    let total = HEADSIZE * 4 + body * 3;
    let arena = Arena::new(total);

    let a = arena.block_at(0); // free predecessor
    let b = arena.block_at(HEADSIZE + body); // the cached junk block
    let c = arena.block_at(2 * (HEADSIZE + body)); // busy stopper

    block::set_size_word(a, body);
    block::set_self_ref(a);

    block::set_size_word(b, body | block::BUSY | block::JUNK | block::PFREE);

    block::set_size_word(c, body | block::BUSY);

    let mut root: Block = std::ptr::null_mut();
    let mut tiny = TinyLists::new();
    tiny.push(a);

    let mut cache = ReclaimCache::new();
    cache.push(cache::index(body), b);

    let mut wilderness: Block = std::ptr::null_mut();
    let saw = reclaim(
      &mut root,
      &mut tiny,
      &mut cache,
      &mut wilderness,
      std::ptr::null_mut(),
      std::ptr::null_mut(),
      0,
    );
    assert!(saw);

    // a absorbed b; the merged block now has a's address and a size
    // spanning both original bodies plus one header.
    assert_eq!(block::body_size(a), body * 2 + HEADSIZE);
    assert!(block::is_pfree(c));
    assert!(!block::is_busy(a));
    assert_eq!(block::self_ref(a), a);
    // merged block is still tiny-sized, so it lands back on a tiny
    // bucket rather than the tree.
    assert_eq!(tiny.head(tiny::index(block::body_size(a))), a);
  }

  #[test]
  fn wanted_block_is_left_busy_for_the_caller() {
    let body = tiny::MAXTINY; // large enough to land on the tree, not tiny
    let total = HEADSIZE * 3 + body * 2;
    let arena = Arena::new(total);

    let fp = arena.block_at(0);
    let stopper = arena.block_at(HEADSIZE + body);

    block::set_size_word(fp, body | block::BUSY | block::JUNK);
    block::set_size_word(stopper, body | block::BUSY);

    let mut root: Block = std::ptr::null_mut();
    let mut tiny = TinyLists::new();
    let mut cache = ReclaimCache::new();
    cache.push(cache::index(body), fp);
    let mut wilderness: Block = std::ptr::null_mut();

    let saw = reclaim(&mut root, &mut tiny, &mut cache, &mut wilderness, std::ptr::null_mut(), fp, 0);
    assert!(saw);
    // left busy: never filed into the tree.
    assert!(root.is_null());
  }
}
