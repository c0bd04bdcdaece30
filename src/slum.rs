/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The slum tracker (SPEC_FULL.md 4.4): contiguous, dirty, same-atom runs of
//! sibling frames. Grounded on
//! `examples/original_source/reiser4/slum_track.c`.
//!
//! `leftmost` holds a [`Weak`] reference rather than the original's owning
//! reference: in this crate frames are kept alive by the block cache's hash
//! table, so the slum does not need to pin them itself, and a strong
//! reference here would form an `Arc` cycle with [`crate::frame::TreeLinks`]
//! (see DESIGN.md).

use crate::{frame::Frame, txn::Atom};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Weak,
};

pub struct Slum {
    atom: Mutex<Option<Arc<Atom>>>,
    leftmost: Mutex<Option<Weak<Frame>>>,
    free_space: AtomicU32,
    num_nodes: AtomicU32,
    being_squeezed: AtomicBool,
}

impl Slum {
    pub fn new(atom: Option<Arc<Atom>>, leftmost: &Arc<Frame>, free_space: u32) -> Arc<Self> {
        Arc::new(Self {
            atom: Mutex::new(atom),
            leftmost: Mutex::new(Some(Arc::downgrade(leftmost))),
            free_space: AtomicU32::new(free_space),
            num_nodes: AtomicU32::new(1),
            being_squeezed: AtomicBool::new(false),
        })
    }

    pub fn atom(&self) -> Option<Arc<Atom>> {
        self.atom.lock().clone()
    }

    pub fn set_atom(&self, atom: Option<Arc<Atom>>) {
        *self.atom.lock() = atom;
    }

    pub fn num_nodes(&self) -> u32 {
        self.num_nodes.load(Ordering::SeqCst)
    }

    pub fn free_space(&self) -> u32 {
        self.free_space.load(Ordering::SeqCst)
    }

    pub fn is_being_squeezed(&self) -> bool {
        self.being_squeezed.load(Ordering::SeqCst)
    }

    pub fn set_being_squeezed(&self, v: bool) {
        self.being_squeezed.store(v, Ordering::SeqCst);
    }

    pub fn leftmost(&self) -> Option<Arc<Frame>> {
        self.leftmost.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_leftmost(&self, frame: &Arc<Frame>) {
        *self.leftmost.lock() = Some(Arc::downgrade(frame));
    }

    /// Account for one more member joining (prepend or append); does not
    /// move `leftmost` — callers update that separately when the new member
    /// becomes the new head.
    pub fn add_node(&self, free_space: u32) {
        self.free_space.fetch_add(free_space, Ordering::SeqCst);
        self.num_nodes.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the remaining node count after removal.
    pub fn remove_node(&self, free_space: u32) -> u32 {
        self.free_space.fetch_sub(free_space.min(self.free_space()), Ordering::SeqCst);
        let prev = self.num_nodes.fetch_sub(1, Ordering::SeqCst);
        prev.saturating_sub(1)
    }
}

/// Eligibility test for a candidate neighbor slum at `node`'s boundary
/// (SPEC_FULL.md 4.4: not being squeezed, and the same atom as `node`).
pub fn neighbor_eligible(neighbor_slum: &Option<Arc<Slum>>, atom: &Option<Arc<Atom>>) -> Option<Arc<Slum>> {
    let slum = neighbor_slum.as_ref()?;
    if slum.is_being_squeezed() {
        return None;
    }
    match (slum.atom(), atom) {
        (Some(a), Some(b)) if Arc::ptr_eq(&a, b) => Some(Arc::clone(slum)),
        _ => None,
    }
}

/// Merge two slums, keeping the larger (by node count) as the survivor
/// (`merge_slums` in the reference implementation). Caller must already
/// hold whatever locks protect both frames' sibling links.
pub fn merge_slums(left: &Arc<Slum>, right: &Arc<Slum>, chain: impl Fn(&Arc<Frame>) -> Option<Arc<Frame>>) -> Arc<Slum> {
    let (large, small) = if left.num_nodes() >= right.num_nodes() {
        (Arc::clone(left), Arc::clone(right))
    } else {
        (Arc::clone(right), Arc::clone(left))
    };
    if let Some(mut cur) = small.leftmost() {
        loop {
            {
                let mut links = cur.tree.lock();
                // stop at small's boundary: a node this chain reaches that
                // isn't a member of `small` belongs to a different slum (or
                // none) and must keep its own pointer untouched.
                if links.slum.as_ref().map_or(true, |s| !Arc::ptr_eq(s, &small)) {
                    break;
                }
                links.slum = Some(Arc::clone(&large));
            }
            match chain(&cur) {
                Some(next) => cur = next,
                None => break,
            }
        }
    }
    large.free_space.fetch_add(small.free_space(), Ordering::SeqCst);
    large.num_nodes.fetch_add(small.num_nodes(), Ordering::SeqCst);
    if Arc::ptr_eq(&large, right) {
        if let Some(new_leftmost) = left.leftmost() {
            large.set_leftmost(&new_leftmost);
        }
    }
    large
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockid::BlockId;

    #[test]
    fn new_slum_has_one_node() {
        let f = Frame::new(crate::frame::next_seq(), BlockId::new(0, 1));
        let s = Slum::new(None, &f, 100);
        assert_eq!(s.num_nodes(), 1);
        assert_eq!(s.free_space(), 100);
    }

    #[test]
    fn add_and_remove_node_tracks_counts() {
        let f = Frame::new(crate::frame::next_seq(), BlockId::new(0, 1));
        let s = Slum::new(None, &f, 100);
        s.add_node(50);
        assert_eq!(s.num_nodes(), 2);
        assert_eq!(s.free_space(), 150);
        let remaining = s.remove_node(50);
        assert_eq!(remaining, 1);
    }
}
