//! The region: owns every free-memory structure and implements the
//! public allocator operations.
//!
//! A region aggregates a segment list, the splay free-tree root, the
//! tiny-list array, the reclaim cache (itself holding the single
//! `last-freed` slot), the wilderness pointer, the arena growth
//! granule `incr`, a running free-size estimator `pool`, and a raw
//! memory provider. Every public method here takes `&mut self`; the
//! exclusive borrow *is* the region-level lock for single-thread use,
//! and [`crate::global`] wraps a `Region` in a `std::sync::Mutex` for
//! the cross-thread case.

use std::cell::Cell;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::block::{self, ALIGN, Block, BODYSIZE, HEADSIZE};
use crate::cache::ReclaimCache;
use crate::error::HeapCorruption;
use crate::provider::{MmapAnon, MmapZero, NativeAlloc, ProgramBreak, RawMemoryProvider};
use crate::reclaim;
use crate::segment::{Segment, SegmentList};
use crate::tiny::TinyLists;
use crate::tree;

/// Wilderness-preservation tuning constant: the compactor leaves the
/// wilderness alone as long as it is smaller than `COMPACT * incr`.
/// Tuning this cannot affect correctness, only how eagerly memory is
/// returned to the provider.
const COMPACT: usize = 8;

/// Floor and starting point for `incr`, the arena growth granule.
const MIN_INCR: usize = 4096;

/// Ceiling on `incr`'s geometric growth, so a long-lived region doesn't
/// end up requesting unreasonably large segments from the provider.
const MAX_INCR: usize = 1 << 24;

bitflags! {
  /// Flags accepted by [`Region::resize`].
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct ResizeFlags: u8 {
    /// Permit falling back to allocate-elsewhere-and-copy when the
    /// block cannot be grown in place.
    const MOVE = 1 << 0;
    /// When moving, copy the old contents into the new block.
    const COPY = 1 << 1;
    /// Zero any newly available tail bytes (whether grown in place or
    /// after a move).
    const ZERO = 1 << 2;
  }
}

pub struct Region {
  segments: SegmentList,
  root: Block,
  tiny: TinyLists,
  cache: ReclaimCache,
  wilderness: Block,
  incr: usize,
  pool: usize,
  provider: Box<dyn RawMemoryProvider>,
  /// Debug-only reentrancy counter: every public entry point bumps it
  /// on entry and drops it on exit, so any call path that accidentally
  /// re-enters a public method on the same region (rather than calling
  /// an `_inner` helper directly) trips the `debug_assert!` in
  /// [`enter`](Self::enter). Rust's `&mut self` already makes the
  /// exclusion itself sound; this counter only backs that assertion.
  lock: Cell<u32>,
}

unsafe impl Send for Region {}

impl Default for Region {
  fn default() -> Self {
    Self::new()
  }
}

impl Region {
  pub fn new() -> Self {
    Self::with_provider(select_default_provider())
  }

  pub(crate) fn with_provider(provider: Box<dyn RawMemoryProvider>) -> Self {
    Self {
      segments: SegmentList::new(),
      root: std::ptr::null_mut(),
      tiny: TinyLists::new(),
      cache: ReclaimCache::new(),
      wilderness: std::ptr::null_mut(),
      incr: MIN_INCR,
      pool: 0,
      provider,
      lock: Cell::new(0),
    }
  }

  fn enter(&self) {
    let depth = self.lock.get();
    debug_assert_eq!(depth, 0, "region entered while already locked; reentrancy must use enter_local");
    self.lock.set(depth + 1);
  }

  fn leave(&self) {
    let depth = self.lock.get();
    debug_assert!(depth > 0);
    self.lock.set(depth - 1);
  }

  // ---- alloc -------------------------------------------------

  pub fn alloc(&mut self, size: usize) -> *mut u8 {
    self.enter();
    let result = self.alloc_inner(size);
    self.leave();
    result
  }

  fn alloc_inner(&mut self, want: usize) -> *mut u8 {
    let size = block::round_request(want);

    if let Some(tp) = self.try_last_freed_fast_path(size) {
      return block::data(tp);
    }

    let mut tp: Block = std::ptr::null_mut();
    for n in (0..=crate::cache::S_CACHE).rev() {
      reclaim::reclaim(
        &mut self.root,
        &mut self.tiny,
        &mut self.cache,
        &mut self.wilderness,
        self.segments.bottom(),
        std::ptr::null_mut(),
        n,
      );
      if !self.root.is_null() {
        tp = tree::search_delete_best_fit(&mut self.root, size);
        if !tp.is_null() {
          break;
        }
      }
    }

    if tp.is_null() && !self.wilderness.is_null() && block::body_size(self.wilderness) >= size {
      tp = self.wilderness;
      self.wilderness = std::ptr::null_mut();
    }

    if tp.is_null() {
      self.compact_opportunistic();
      tp = self.extend(size);
      if tp.is_null() {
        warn!("alloc({want}): provider exhausted, returning null");
        return std::ptr::null_mut();
      }
    }

    self.finish_got_block(tp, size);
    block::data(tp)
  }

  /// Reuse `last-freed` when it is within `[size, 2*size)`.
  fn try_last_freed_fast_path(&mut self, size: usize) -> Option<Block> {
    let tp = self.cache.last_freed();
    if tp.is_null() {
      return None;
    }
    debug_assert!(block::is_busy(tp) && block::is_junk(tp));
    self.cache.take_last_freed();

    let s = block::body_size(tp);
    if s < size || s >= size << 1 {
      self.cache.push(crate::cache::S_CACHE, tp);
      return None;
    }

    if s >= size + HEADSIZE + BODYSIZE {
      block::set_size(tp, size);
      let np = block::next_physical(tp);
      block::set_seg(np, block::seg(tp));
      block::set_size_word(np, (s - size - HEADSIZE) | block::BUSY | block::JUNK);
      self.cache.set_last_freed(np);
    }
    block::clear_junk(tp);
    trace!("alloc: served from last-freed ({size} bytes)");
    Some(tp)
  }

  /// Finishes installing a block obtained from the reclaimed, wilderness,
  /// or freshly-extended path: splits off a surplus tail if one exists,
  /// then marks the remainder busy.
  fn finish_got_block(&mut self, tp: Block, size: usize) {
    let next = block::next_physical(tp);
    block::clear_pfree(next);

    let total = block::body_size(tp);
    if total >= size + HEADSIZE + BODYSIZE {
      block::set_size(tp, size);
      let np = block::next_physical(tp);
      block::set_seg(np, block::seg(tp));
      block::set_size_word(np, (total - size - HEADSIZE) | block::BUSY | block::JUNK);

      if crate::segment::is_wilderness_candidate(self.segments.bottom(), np) {
        block::clear_tags(np);
        block::set_self_ref(np);
        let ap = block::next_physical(np);
        block::set_pfree(ap);
        self.wilderness = np;
      } else {
        self.cache.set_last_freed(np);
      }
    }
    block::set_busy(tp);
  }

  // ---- free ----------------------------------------------------

  pub fn free(&mut self, addr: *mut u8) {
    if addr.is_null() {
      return;
    }
    self.enter();
    self.free_inner(addr);
    self.leave();
  }

  fn free_inner(&mut self, addr: *mut u8) {
    let bp = block::block_of(addr);
    let size = block::body_size(bp);

    if !block::is_busy(bp) || block::is_junk(bp) {
      // Double-free or bogus address: tolerated silently in release builds.
      debug_assert!(false, "double free or invalid free at {:p}", addr);
      return;
    }

    self.pool = (self.pool + size) / 2;
    block::set_junk(bp);
    self.cache.classify(bp);

    if size >= 2 * self.incr {
      reclaim::reclaim(
        &mut self.root,
        &mut self.tiny,
        &mut self.cache,
        &mut self.wilderness,
        self.segments.bottom(),
        std::ptr::null_mut(),
        0,
      );
      if !self.wilderness.is_null() && block::body_size(self.wilderness) >= COMPACT * self.incr {
        self.compact_opportunistic();
      }
    }
  }

  // ---- resize ----------------------------------------------------

  pub fn resize(&mut self, addr: *mut u8, new_size: usize, flags: ResizeFlags) -> *mut u8 {
    if addr.is_null() {
      return self.alloc(new_size);
    }
    if new_size == 0 {
      self.free(addr);
      return std::ptr::null_mut();
    }
    self.enter();
    let result = self.resize_inner(addr, new_size, flags);
    self.leave();
    result
  }

  fn resize_inner(&mut self, addr: *mut u8, want: usize, flags: ResizeFlags) -> *mut u8 {
    let size = block::round_request(want);
    let rp = block::block_of(addr);
    debug_assert!(block::is_busy(rp) && !block::is_junk(rp));
    let old_size = block::body_size(rp);

    if old_size < size {
      self.grow_in_place(rp, size);
    }

    let current = block::body_size(rp);
    let result = if current >= size + BODYSIZE + HEADSIZE {
      // Split off the now-surplus tail and route it through the cache.
      block::set_size(rp, size);
      let np = block::next_physical(rp);
      block::set_seg(np, block::seg(rp));
      block::set_size_word(np, (current - size - HEADSIZE) | block::BUSY | block::JUNK);
      self.cache.classify(np);
      reclaim::reclaim(
        &mut self.root,
        &mut self.tiny,
        &mut self.cache,
        &mut self.wilderness,
        self.segments.bottom(),
        std::ptr::null_mut(),
        crate::cache::S_CACHE,
      );
      Some(addr)
    } else if current < size {
      if !flags.intersects(ResizeFlags::MOVE | ResizeFlags::COPY) {
        None
      } else {
        let copy_len = current.min(size);
        let new_addr = self.alloc_inner(want);
        if !new_addr.is_null() {
          if flags.contains(ResizeFlags::COPY) {
            unsafe { std::ptr::copy_nonoverlapping(addr, new_addr, copy_len) };
          }
          self.free_inner(addr);
        }
        Some(new_addr).filter(|p| !p.is_null())
      }
    } else {
      Some(addr)
    };

    match result {
      Some(new_addr) if flags.contains(ResizeFlags::ZERO) => {
        let sz = block::body_size(block::block_of(new_addr));
        if sz > old_size {
          unsafe { std::ptr::write_bytes(new_addr.add(old_size), 0, sz - old_size) };
        }
        new_addr
      }
      Some(new_addr) => new_addr,
      None => std::ptr::null_mut(),
    }
  }

  /// Absorbs free/junk neighbors forward, and if still
  /// short and the block abuts the bottom segment's sentinel, ask the
  /// provider to grow that segment in place.
  fn grow_in_place(&mut self, rp: Block, size: usize) {
    loop {
      let current = block::body_size(rp);
      if current >= size {
        break;
      }
      let np = block::next_physical(rp);
      if np == self.wilderness {
        self.wilderness = std::ptr::null_mut();
        let absorbed = block::body_size(np);
        block::set_size(rp, current + absorbed + HEADSIZE);
      } else if block::is_junk(np) {
        let idx = crate::cache::index(block::body_size(np));
        reclaim::reclaim(
          &mut self.root,
          &mut self.tiny,
          &mut self.cache,
          &mut self.wilderness,
          self.segments.bottom(),
          np,
          idx,
        );
        let absorbed = block::body_size(np);
        block::set_size(rp, current + absorbed + HEADSIZE);
      } else if !block::is_busy(np) {
        let absorbed = block::body_size(np);
        tree::remove_known(&mut self.root, absorbed, np);
        block::set_size(rp, current + absorbed + HEADSIZE);
      } else {
        break;
      }
      let next = block::next_physical(rp);
      block::clear_pfree(next);
    }

    let current = block::body_size(rp);
    if current < size && size > self.incr && crate::segment::is_wilderness_candidate(self.segments.bottom(), rp)
    {
      let deficit = crate::align::round_multiple((size - current) + HEADSIZE, self.incr);
      if let Some(seg) = unsafe { block::seg(rp).as_mut() } {
        if let Ok(Some(range)) = self.provider.resize_in_place(seg.base, seg.extent, seg.extent + deficit) {
          seg.extent += deficit;
          seg.size += deficit;
          seg.end = unsafe { range.base.add(range.size) };
          block::set_size(rp, current + deficit);
          let np = block::next_physical(rp);
          block::set_seg(np, seg as *mut Segment);
          block::set_size_word(np, block::BUSY);
        }
      }
    }
  }

  // ---- align ----------------------------------------------------

  pub fn align(&mut self, size: usize, alignment: usize) -> *mut u8 {
    self.enter();
    let result = self.align_inner(size, alignment);
    self.leave();
    result
  }

  fn align_inner(&mut self, want: usize, want_align: usize) -> *mut u8 {
    let size = block::round_request(want);
    let alignment = crate::align::round_multiple(want_align.max(ALIGN), ALIGN);

    let request = size + 2 * (alignment + HEADSIZE);
    let base_addr = self.alloc_inner(request);
    if base_addr.is_null() {
      return std::ptr::null_mut();
    }
    let bp = block::block_of(base_addr);

    let aligned = crate::align::align_up(base_addr as usize, alignment) as *mut u8;

    // Carve a leading fragment if the aligned position isn't within one
    // block's worth of the body start.
    if (aligned as usize) - (base_addr as usize) >= HEADSIZE + BODYSIZE {
      let lead_size = (aligned as usize) - (base_addr as usize) - HEADSIZE;
      let head_block = block::block_of(aligned);
      block::set_seg(head_block, block::seg(bp));
      block::set_size_word(head_block, block::body_size(bp) - lead_size - HEADSIZE);
      block::set_size_word(bp, lead_size | block::BUSY | block::JUNK);
      self.cache.classify(bp);
    }

    let head_block = block::block_of(aligned);
    let remaining = block::body_size(head_block);
    if remaining >= size + HEADSIZE + BODYSIZE {
      block::set_size(head_block, size);
      let tail = block::next_physical(head_block);
      block::set_seg(tail, block::seg(head_block));
      block::set_size_word(tail, (remaining - size - HEADSIZE) | block::BUSY | block::JUNK);
      self.cache.classify(tail);
    }

    block::set_busy(head_block);
    reclaim::reclaim(
      &mut self.root,
      &mut self.tiny,
      &mut self.cache,
      &mut self.wilderness,
      self.segments.bottom(),
      std::ptr::null_mut(),
      crate::cache::S_CACHE,
    );

    debug_assert_eq!(aligned as usize % alignment, 0);
    aligned
  }

  // ---- address-check and size-of ----------------------

  pub fn address_check(&self, addr: *mut u8) -> i32 {
    if addr.is_null() {
      return -1;
    }
    let seg = self.segments.find(addr);
    if seg.is_null() {
      return -1;
    }
    let mut b = unsafe { (*seg).block() };
    let end = unsafe { (*seg).sentinel() };
    while (b as *mut u8) < (end as *mut u8) {
      let data = block::data(b);
      let size = block::body_size(b);
      if addr == data {
        return if block::is_busy(b) && !block::is_junk(b) { 0 } else { -1 };
      }
      b = unsafe { (data.add(size)) as Block };
    }
    -1
  }

  pub fn size_of(&self, addr: *mut u8) -> isize {
    if self.address_check(addr) != 0 {
      return -1;
    }
    block::body_size(block::block_of(addr)) as isize
  }

  // ---- compact ----------------------------------------------------

  pub fn compact(&mut self) -> i32 {
    self.enter();
    self.compact_inner();
    self.leave();
    0
  }

  fn compact_opportunistic(&mut self) {
    self.compact_inner();
  }

  fn compact_inner(&mut self) {
    let mut seg = self.segments.head();
    while !seg.is_null() {
      let next_seg = unsafe { (*seg).next };
      self.compact_segment(seg);
      seg = next_seg;
    }
    reclaim::reclaim(
      &mut self.root,
      &mut self.tiny,
      &mut self.cache,
      &mut self.wilderness,
      self.segments.bottom(),
      std::ptr::null_mut(),
      0,
    );
  }

  fn compact_segment(&mut self, seg: *mut Segment) {
    let sentinel = unsafe { (*seg).sentinel() };
    if !block::is_pfree(sentinel) {
      return;
    }
    let bp = block::last_physical(sentinel);
    let bp_size = block::body_size(bp);

    let is_bottom = seg == self.segments.bottom();
    if is_bottom && bp == self.wilderness {
      if bp_size < COMPACT * self.incr.max(MIN_INCR) || bp_size < 2 * self.pool {
        return;
      }
    }

    if bp == self.wilderness {
      self.wilderness = std::ptr::null_mut();
    } else {
      tree::remove_known(&mut self.root, bp_size, bp);
    }

    let segment_size = unsafe { (*seg).extent };
    let shrink = segment_size.min(bp_size + HEADSIZE);
    let base = unsafe { (*seg).base };

    match self.provider.release(base, shrink) {
      Ok(()) if shrink == segment_size => {
        debug!("compact: released whole segment at {:p}", base);
        self.segments.unlink(seg);
      }
      Ok(()) => {
        debug!("compact: trimmed {shrink} bytes off segment at {:p}", base);
        // Surviving fragment becomes a fresh free block, reclaimed below.
        let remaining = segment_size - shrink;
        if remaining >= HEADSIZE + BODYSIZE {
          unsafe {
            (*seg).extent = remaining;
            (*seg).size = remaining;
          }
          block::set_size_word(bp, (remaining - HEADSIZE) | block::BUSY | block::JUNK);
          block::set_seg(bp, seg);
          self.cache.classify(bp);
        }
      }
      Err(_) => {
        // Provider refused; put the block back where we found it.
        if is_bottom && crate::segment::is_wilderness_candidate(self.segments.bottom(), bp) {
          block::clear_tags(bp);
          block::set_self_ref(bp);
          self.wilderness = bp;
        } else {
          self.cache.classify(bp);
        }
      }
    }
  }

  // ---- segment growth ----------------------------------------------------

  /// Acquires a new segment sized to at least `want` body bytes,
  /// returning its one giant free block (tags clear, not yet
  /// busy — the caller finishes the transition via
  /// [`finish_got_block`](Self::finish_got_block)).
  fn extend(&mut self, want: usize) -> Block {
    let body_size = crate::align::round_multiple(want.max(self.incr), ALIGN);
    let total = 2 * HEADSIZE + body_size;

    let range = match self.provider.acquire(total) {
      Ok(r) => r,
      Err(e) => {
        warn!("extend({want}): provider acquire failed: {e}");
        return std::ptr::null_mut();
      }
    };

    let actual_body = range.size - 2 * HEADSIZE;
    let seg = Box::new(Segment {
      base: range.base,
      end: unsafe { range.base.add(range.size) },
      extent: range.size,
      size: range.size,
      next: std::ptr::null_mut(),
    });
    let seg_ptr = self.segments.push(seg);

    let blk = unsafe { (*seg_ptr).block() };
    block::set_seg(blk, seg_ptr);
    block::set_size_word(blk, actual_body);

    let sentinel = unsafe { (*seg_ptr).sentinel() };
    block::set_seg(sentinel, seg_ptr);
    block::set_size_word(sentinel, block::BUSY);

    self.incr = (self.incr * 2).min(MAX_INCR);
    blk
  }
}

/// Probes a backend's availability by acquiring and immediately
/// releasing a small range, returning it for real use only if that
/// round trip succeeds.
fn probe_then_release<P: RawMemoryProvider>(mut provider: P, probe_size: usize) -> Option<P> {
  let range = provider.acquire(probe_size).ok()?;
  let _ = provider.release(range.base, range.size);
  Some(provider)
}

/// Tries each backend in turn and returns the first that is actually
/// available, matching the documented preference order. Anonymous
/// `mmap` covers both the OS virtual-memory allocator and the anon-map
/// backend (the same syscall serves both roles on this target), so a
/// single probe stands in for that pair; the `/dev/zero` mapping,
/// `sbrk`, and the native allocator fallback follow in turn, with the
/// native allocator always succeeding as the last resort.
fn select_default_provider() -> Box<dyn RawMemoryProvider> {
  const PROBE_SIZE: usize = MIN_INCR;

  if let Some(p) = probe_then_release(MmapAnon::with_probe(true), PROBE_SIZE) {
    return Box::new(p);
  }
  if let Ok(zero) = MmapZero::open() {
    if let Some(p) = probe_then_release(zero, PROBE_SIZE) {
      return Box::new(p);
    }
  }
  if let Some(p) = probe_then_release(ProgramBreak::new(), PROBE_SIZE) {
    return Box::new(p);
  }
  Box::new(NativeAlloc::new())
}

/// Always-compilable consistency audit: walks every segment and the
/// free tree and reports the first invariant violation found, rather
/// than a debug-only assertion.
pub mod audit {
  use super::*;

  pub fn check(region: &Region) -> Result<(), HeapCorruption> {
    check_segments(region)?;
    check_tree(region.root)?;
    Ok(())
  }

  fn check_segments(region: &Region) -> Result<(), HeapCorruption> {
    for seg in region.segments.iter() {
      let mut b = unsafe { (*seg).block() };
      let end = unsafe { (*seg).sentinel() };
      while (b as *mut u8) < (end as *mut u8) {
        if block::seg(b) != seg {
          return Err(HeapCorruption::WrongSegment {
            addr: block::data(b),
            claimed: block::seg(b) as *mut u8,
            actual: seg as *mut u8,
          });
        }
        if !block::is_busy(b) {
          if block::raw_size_word(b) & block::TAGS != 0 {
            return Err(HeapCorruption::TaggedFreeBlock {
              addr: block::data(b),
              tags: block::raw_size_word(b) & block::TAGS,
            });
          }
          if block::self_ref(b) != b {
            return Err(HeapCorruption::BadSelfReference { addr: block::data(b) });
          }
        }
        if block::is_pfree(b) && !block::is_busy(block::last_physical(b)) {
          return Err(HeapCorruption::BadPfree { addr: block::data(b) });
        }
        b = block::next_physical(b);
      }
    }
    Ok(())
  }

  fn check_tree(root: Block) -> Result<(), HeapCorruption> {
    if root.is_null() {
      return Ok(());
    }
    if !tree::check_subtree(root) {
      return Err(HeapCorruption::TreeOutOfOrder { addr: block::data(root) });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resize_flags_combine_as_bits() {
    let f = ResizeFlags::MOVE | ResizeFlags::ZERO;
    assert!(f.contains(ResizeFlags::MOVE));
    assert!(f.contains(ResizeFlags::ZERO));
    assert!(!f.contains(ResizeFlags::COPY));
  }

  #[test]
  fn alloc_zero_then_free_round_trips() {
    let mut region = Region::with_provider(Box::new(crate::provider::NativeAlloc::new()));
    let p = region.alloc(0);
    assert!(!p.is_null());
    assert_eq!(region.address_check(p), 0);
    region.free(p);
    assert_eq!(region.address_check(p), -1);
  }

  #[test]
  fn alloc_free_alloc_reuses_last_freed_address() {
    let mut region = Region::with_provider(Box::new(crate::provider::NativeAlloc::new()));
    let a = region.alloc(40);
    let b = region.alloc(40);
    assert_ne!(a, b);
    region.free(a);
    let c = region.alloc(40);
    assert_eq!(a, c);
  }

  #[test]
  fn resize_grow_then_shrink_preserves_contents() {
    let mut region = Region::with_provider(Box::new(crate::provider::NativeAlloc::new()));
    let p = region.alloc(32);
    unsafe { std::ptr::write_bytes(p, 0xAB, 32) };
    let grown = region.resize(p, 4096, ResizeFlags::MOVE | ResizeFlags::COPY);
    assert!(!grown.is_null());
    assert!(region.size_of(grown) >= 4096);
    assert_eq!(unsafe { *grown }, 0xAB);
    let shrunk = region.resize(grown, 16, ResizeFlags::empty());
    assert!(!shrunk.is_null());
    assert!(region.size_of(shrunk) >= 16);
  }

  #[test]
  fn address_check_rejects_interior_and_freed_addresses() {
    let mut region = Region::with_provider(Box::new(crate::provider::NativeAlloc::new()));
    let p = region.alloc(256);
    assert_eq!(region.address_check(p), 0);
    assert_eq!(region.address_check(unsafe { p.add(8) }), -1);
    region.free(p);
    assert_eq!(region.address_check(p), -1);
  }

  #[test]
  fn audit_is_clean_after_a_mixed_workload() {
    let mut region = Region::with_provider(Box::new(crate::provider::NativeAlloc::new()));
    let mut live = Vec::new();
    for i in 0..64 {
      let p = region.alloc(16 + (i % 5) * 24);
      live.push(p);
    }
    for (i, p) in live.iter().enumerate() {
      if i % 2 == 0 {
        region.free(*p);
      }
    }
    assert!(audit::check(&region).is_ok());
  }
}
