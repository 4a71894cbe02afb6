//! Internal error types.
//!
//! None of these cross the public API: `alloc`/`resize`/`align` still
//! return nil, `address_check`/`size_of` still return `-1`, and `free`
//! stays silent. These types exist so the provider layer and the debug
//! audit have something richer than `Option<()>` to log and test against
//! before they're collapsed to the public contract.

use thiserror::Error;

/// Why a raw-memory provider call failed to produce or adjust a range.
#[derive(Debug, Error)]
pub enum ProviderError {
  #[error("provider refused to acquire {requested} bytes")]
  Refused { requested: usize },
  #[error("provider range [{addr:p}, +{size}) faulted on probe")]
  Unaddressable { addr: *mut u8, size: usize },
  #[error("provider refused to release segment at {addr:p}")]
  ReleaseRefused { addr: *mut u8 },
}

// Raw pointers aren't `Send`/`Sync` by default; `ProviderError` only ever
// carries an address for display purposes; it is never dereferenced.
unsafe impl Send for ProviderError {}
unsafe impl Sync for ProviderError {}

/// A violation of one of the block/tree/segment invariants, found by the
/// audit pass (`region::audit`): an always-compilable, testable result
/// rather than a debug-only assertion.
#[derive(Debug, Error)]
pub enum HeapCorruption {
  #[error("free block at {addr:p} carries a tag bit: {tags:#x}")]
  TaggedFreeBlock { addr: *mut u8, tags: usize },
  #[error("free block at {addr:p} has a broken self-reference")]
  BadSelfReference { addr: *mut u8 },
  #[error("block at {addr:p} has PFREE set but its predecessor is not free")]
  BadPfree { addr: *mut u8 },
  #[error("block at {addr:p} claims segment {claimed:p}, but lives in {actual:p}")]
  WrongSegment { addr: *mut u8, claimed: *mut u8, actual: *mut u8 },
  #[error("free-tree ordering violated at node {addr:p}")]
  TreeOutOfOrder { addr: *mut u8 },
  #[error("equal-size chain member at {addr:p} has size {actual}, expected {expected}")]
  ChainSizeMismatch { addr: *mut u8, actual: usize, expected: usize },
  #[error("segment accounting mismatch: tracked {tracked} bytes, providers hold {actual}")]
  SegmentAccounting { tracked: usize, actual: usize },
}

unsafe impl Send for HeapCorruption {}
unsafe impl Sync for HeapCorruption {}
