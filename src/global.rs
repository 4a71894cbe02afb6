//! Process-wide default heap region, lazily initialized behind a safe
//! publication guard. Exactly one such default region exists per
//! process; `Region`'s own reentrancy discipline already keeps any one
//! thread's access to it serialized, so the guard here is just a
//! `std::sync::Mutex<Region>` behind a `std::sync::OnceLock` to add
//! cross-thread exclusion.

use std::sync::{Mutex, OnceLock};

use crate::region::{Region, ResizeFlags};

static DEFAULT: OnceLock<Mutex<Region>> = OnceLock::new();

fn default_region() -> &'static Mutex<Region> {
  DEFAULT.get_or_init(|| Mutex::new(Region::new()))
}

/// Allocates `size` bytes from the process-wide default region.
pub fn alloc(size: usize) -> *mut u8 {
  default_region().lock().unwrap().alloc(size)
}

/// Frees a body address previously returned by [`alloc`], [`align`], or
/// [`resize`].
pub fn free(addr: *mut u8) {
  default_region().lock().unwrap().free(addr)
}

/// Resizes a body address previously returned by this module.
pub fn resize(addr: *mut u8, new_size: usize, flags: ResizeFlags) -> *mut u8 {
  default_region().lock().unwrap().resize(addr, new_size, flags)
}

/// Allocates `size` bytes aligned to `alignment` from the default region.
pub fn align(size: usize, alignment: usize) -> *mut u8 {
  default_region().lock().unwrap().align(size, alignment)
}

/// `0` if `addr` is the body start of a busy, non-junk block in the
/// default region; `-1` otherwise.
pub fn address_check(addr: *mut u8) -> i32 {
  default_region().lock().unwrap().address_check(addr)
}

/// The body size of `addr` in the default region, or `-1` if `addr`
/// isn't a valid busy body start.
pub fn size_of(addr: *mut u8) -> isize {
  default_region().lock().unwrap().size_of(addr)
}

/// Releases unused tail memory of the default region's segments back to
/// its raw-memory provider.
pub fn compact() -> i32 {
  default_region().lock().unwrap().compact()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_region_serves_concurrent_allocations() {
    let handles: Vec<_> = (0..8)
      .map(|i| std::thread::spawn(move || alloc(16 + i * 8)))
      .collect();
    let ptrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for p in &ptrs {
      assert!(!p.is_null());
      assert_eq!(address_check(*p), 0);
    }
    for p in ptrs {
      free(p);
    }
  }
}
