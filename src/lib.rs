//! # bestheap — a best-fit region allocator over raw OS memory
//!
//! This crate grew out of a simple `sbrk`-based bump allocator into a
//! full best-fit allocator in the style of AT&T ksh's `vmbest` method:
//! a splay tree of free blocks keyed by exact size, fast paths for tiny
//! blocks and a single last-freed slot, a distinguished "wilderness"
//! block at the high end of the arena, and a deferred reclaim/coalesce
//! engine that merges adjacent free blocks using O(1) boundary tags.
//!
//! ## Overview
//!
//! ```text
//!   A region owns:
//!
//!   ┌───────────────┬───────────────┬───────────────┬──────────────┐
//!   │  segment list │  splay tree   │  tiny lists   │ reclaim cache│
//!   │ (raw memory)  │ (size-keyed)  │ (size < 96)   │ (deferred    │
//!   │               │               │               │  frees)      │
//!   └───────────────┴───────────────┴───────────────┴──────────────┘
//!                            │
//!                   wilderness pointer
//!          (the free block abutting the bottom segment's end)
//! ```
//!
//! `alloc` looks in last-freed, then the cache (reclaiming as it goes),
//! then the tree, then the wilderness, before asking the raw-memory
//! provider to extend the arena. `free` never does structural work
//! itself — it tags the block `JUNK` and drops it in the cache; the
//! reclaim engine is what actually merges neighbors back together,
//! triggered opportunistically by `alloc`, by freeing a large block, or
//! by `compact`.
//!
//! ## Crate structure
//!
//! ```text
//!   bestheap
//!   ├── align    - alignment/rounding helpers
//!   ├── block    - block header layout and bit-tag primitives
//!   ├── segment  - the segment list and sentinel/bottom-segment rules
//!   ├── tree     - the splay free-tree and its equal-size chains
//!   ├── tiny     - fixed-size tiny free-lists, the tiniest double-link class
//!   ├── cache    - the reclaim cache and its last-freed slot
//!   ├── reclaim  - the reclaim/coalesce engine
//!   ├── provider - the raw-memory provider trait and its backends
//!   ├── error    - internal error types for the provider and the audit
//!   ├── region   - the Region type: owns everything, implements the public ops
//!   └── global   - a lazily-initialized process-wide default Region
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use bestheap::{Region, ResizeFlags};
//!
//! let mut region = Region::new();
//! let p = region.alloc(128);
//! assert_eq!(region.address_check(p), 0);
//!
//! let grown = region.resize(p, 4096, ResizeFlags::MOVE | ResizeFlags::COPY);
//! assert!(region.size_of(grown) >= 4096);
//!
//! region.free(grown);
//! region.compact();
//! ```
//!
//! Or use the process-wide default region directly:
//!
//! ```rust
//! use bestheap::global;
//!
//! let p = global::alloc(64);
//! global::free(p);
//! ```
//!
//! ## Safety
//!
//! This crate manages raw memory directly: block headers are walked
//! through raw pointers rather than typed references, because the same
//! bytes are read as a tiny-list node, a splay-tree node, or a sentinel
//! depending on where they currently live. Every unsafe block carries a
//! documented invariant it relies on; callers of the public API
//! (`alloc`/`resize`/`free`/`align`/`address_check`/`size_of`/`compact`)
//! never need `unsafe` themselves.

mod align;
mod block;
mod cache;
pub mod error;
pub mod global;
mod provider;
mod reclaim;
mod region;
mod segment;
mod tiny;
mod tree;

pub use region::{Region, ResizeFlags, audit};
