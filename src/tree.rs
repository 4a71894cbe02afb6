//! Free-tree: a splay tree of free blocks keyed by exact size, with
//! equal-size blocks chained off the tree node that first claimed that
//! size.
//!
//! Only the chain *head* is tree-navigable (`LEFT`/`RIGHT` are valid
//! child pointers only on it); later arrivals of the same size are
//! threaded onto the head's `LINK` chain and carry the [`LINK`] tag so
//! a walk can tell a chain member from a genuine leaf.
//!
//! The search/delete routine below is a textbook top-down splay
//! (Sleator–Tarjan): as the search descends, everything found strictly
//! smaller than the target is threaded onto a growing "L tree" and
//! everything strictly larger onto a growing "R tree"; when the walk
//! ends (exact match, or falls off a leaf) the two partial trees and
//! whatever was found are spliced back into a single tree rooted near
//! the query, which is the amortized part of the splay discipline.

use crate::block::{self, Block};

/// Finds the node matching `size` or, failing that, the node holding
/// the smallest size strictly greater than `size` (next-fit), removes
/// it from the tree, and returns it. If the matched node had equal-size
/// siblings, the next sibling is promoted into its tree position; the
/// returned block is whichever chain member was removed, never the
/// promoted one. Returns null if the tree has nothing `>= size`.
pub(crate) fn search_delete_best_fit(root: &mut Block, size: usize) -> Block {
  remove(root, size, std::ptr::null_mut())
}

/// Removes a known block from wherever it lives relative to the tree:
/// if it is the tree-navigable head for its size, performs the splay
/// delete (promoting a sibling if one exists); if it is a subordinate
/// chain member, splices it out of the chain in place without
/// disturbing the tree structure at all. `size` must equal `wanted`'s
/// exact body size.
pub(crate) fn remove_known(root: &mut Block, size: usize, wanted: Block) -> Block {
  debug_assert!(!wanted.is_null());
  remove(root, size, wanted)
}

/// Leaf-inserts `fp` (a fully merged, untagged free block with
/// `LEFT`/`RIGHT`/`LINK` all cleared) into the tree rooted at `root`.
/// Equal-size blocks are threaded onto the existing node's chain
/// instead of creating a duplicate tree node.
pub(crate) fn insert(root: &mut Block, fp: Block) {
  block::set_left(fp, std::ptr::null_mut());
  block::set_right(fp, std::ptr::null_mut());
  block::set_link(fp, std::ptr::null_mut());

  if root.is_null() {
    *root = fp;
    return;
  }

  let size = block::body_size(fp);
  let mut np = *root;
  loop {
    let s = block::body_size(np);
    if s > size {
      let t = block::left(np);
      if t.is_null() {
        block::set_left(np, fp);
        return;
      }
      np = t;
    } else if s < size {
      let t = block::right(np);
      if t.is_null() {
        block::set_right(np, fp);
        return;
      }
      np = t;
    } else {
      // Equal size: thread fp onto np's chain, directly after np.
      let t = block::link(np);
      if !t.is_null() {
        block::set_link(fp, t);
        block::set_left(t, fp);
      }
      block::set_link(np, fp);
      block::set_left(fp, np);
      block::set_link_bit(fp);
      return;
    }
  }
}

/// Core top-down splay search-and-delete. When `wanted` is null this is
/// a best-fit search (exact or next-larger); when non-null it removes
/// exactly that block (see [`remove_known`]).
fn remove(root: &mut Block, size: usize, wanted: Block) -> Block {
  if !wanted.is_null() {
    // Fast path: wanted is a subordinate chain member, not the tree
    // node itself — splice it out of the LINK chain in place.
    if let Some(head) = find_chain_head(*root, size) {
      if head != wanted && unlink_from_chain(head, wanted) {
        return wanted;
      }
    }
  }

  let mut l_tail: Block = std::ptr::null_mut();
  let mut l_head: Block = std::ptr::null_mut();
  let mut r_tail: Block = std::ptr::null_mut();
  let mut r_head: Block = std::ptr::null_mut();

  let mut node = *root;
  let found: Block;
  loop {
    if node.is_null() {
      found = std::ptr::null_mut();
      break;
    }
    let s = block::body_size(node);
    if size == s {
      found = node;
      break;
    }
    if size < s {
      let t = block::left(node);
      let next = if !t.is_null() {
        let ts = block::body_size(t);
        if size <= ts {
          // zig: rotate t up.
          block::set_left(node, block::right(t));
          block::set_right(t, node);
          node = t;
          if size == block::body_size(node) {
            found = node;
            break;
          }
          block::left(node)
        } else {
          r_attach(&mut r_tail, &mut r_head, t);
          block::right(t)
        }
      } else {
        std::ptr::null_mut()
      };
      l_attach(&mut l_tail, &mut l_head, node);
      node = next;
    } else {
      let t = block::right(node);
      let next = if !t.is_null() {
        let ts = block::body_size(t);
        if size >= ts {
          block::set_right(node, block::left(t));
          block::set_left(t, node);
          node = t;
          if size == block::body_size(node) {
            found = node;
            break;
          }
          block::right(node)
        } else {
          l_attach(&mut l_tail, &mut l_head, t);
          block::left(t)
        }
      } else {
        std::ptr::null_mut()
      };
      r_attach(&mut r_tail, &mut r_head, node);
      node = next;
    }
  }

  let mut result = found;
  if !found.is_null() {
    // Graft the found node's own subtrees onto the L/R trees we built
    // while descending past it.
    if l_tail.is_null() {
      l_head = block::left(found);
    } else {
      block::set_right(l_tail, block::left(found));
    }
    if r_tail.is_null() {
      r_head = block::right(found);
    } else {
      block::set_left(r_tail, block::right(found));
    }
  } else {
    // Nothing matched exactly; terminate both partial chains, then
    // extract the minimum of the R tree as the best (next-larger) fit.
    if !l_tail.is_null() {
      block::set_right(l_tail, std::ptr::null_mut());
    }
    if !r_tail.is_null() {
      block::set_left(r_tail, std::ptr::null_mut());
    }
    if !r_head.is_null() {
      let mut cand = r_head;
      while !block::left(cand).is_null() {
        let t = block::left(cand);
        block::set_left(cand, block::right(t));
        block::set_right(t, cand);
        cand = t;
      }
      r_head = block::right(cand);
      result = cand;
    }
  }

  // `result`, when non-null, is always a tree-navigable head: the
  // splay descent and the min-extraction rotations both only ever
  // follow LEFT/RIGHT pointers, and only heads are ever attached as a
  // LEFT/RIGHT child (subordinate chain members are reachable only via
  // LINK). So a non-null `link(result)` always means "head with a
  // chain", never "I am myself a subordinate".
  *root = if !result.is_null() && !block::link(result).is_null() {
    // Promote the next equal-size sibling into the tree position.
    let sibling = block::link(result);
    block::set_left(sibling, l_head);
    block::set_right(sibling, r_head);
    block::clear_link_bit(sibling);
    sibling
  } else if !r_head.is_null() {
    let mut t = r_head;
    while !block::left(t).is_null() {
      let lc = block::left(t);
      block::set_left(t, block::right(lc));
      block::set_right(lc, t);
      t = lc;
    }
    block::set_left(t, l_head);
    t
  } else {
    l_head
  };

  result
}

fn r_attach(tail: &mut Block, head: &mut Block, x: Block) {
  if tail.is_null() {
    *head = x;
  } else {
    block::set_left(*tail, x);
  }
  *tail = x;
}

fn l_attach(tail: &mut Block, head: &mut Block, x: Block) {
  if tail.is_null() {
    *head = x;
  } else {
    block::set_right(*tail, x);
  }
  *tail = x;
}

/// Locates the tree-navigable head for `size`, without removing
/// anything, by ordinary (non-splaying) BST search.
fn find_chain_head(root: Block, size: usize) -> Option<Block> {
  let mut node = root;
  while !node.is_null() {
    let s = block::body_size(node);
    if s == size {
      return Some(node);
    }
    node = if size < s { block::left(node) } else { block::right(node) };
  }
  None
}

/// Splices `wanted` out of `head`'s equal-size chain. Returns `false`
/// if `wanted` is not actually a member (a caller bug).
fn unlink_from_chain(head: Block, wanted: Block) -> bool {
  let mut prev = head;
  let mut cur = block::link(head);
  while !cur.is_null() {
    if cur == wanted {
      block::set_link(prev, block::link(cur));
      if !block::link(cur).is_null() {
        block::set_left(block::link(cur), prev);
      }
      return true;
    }
    prev = cur;
    cur = block::link(cur);
  }
  false
}

/// Checks that the subtree rooted at `node` is a valid BST on size, with
/// every equal-size chain member actually equal in size. Used by the
/// always-on consistency audit, not gated to test builds.
pub(crate) fn check_subtree(node: Block) -> bool {
  if node.is_null() {
    return true;
  }
  let size = block::body_size(node);
  let mut t = block::link(node);
  while !t.is_null() {
    if block::body_size(t) != size {
      return false;
    }
    t = block::link(t);
  }
  let l = block::left(node);
  if !l.is_null() {
    if block::body_size(l) >= size || !check_subtree(l) {
      return false;
    }
  }
  let r = block::right(node);
  if !r.is_null() {
    if block::body_size(r) <= size || !check_subtree(r) {
      return false;
    }
  }
  true
}
