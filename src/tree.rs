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

//! Sibling/parent connectivity and slum orchestration (SPEC_FULL.md 4.4/4.5).
//!
//! The original implementation protects sibling links, parent hints and the
//! slum pointer with one global spinlock held only ever for a short,
//! non-sleeping critical section. This crate keeps those same fields but
//! protects them with each frame's own `tree` mutex instead of a single
//! global one, taking both mutexes (seq-ordered, exactly like
//! [`crate::frame::order_pair`]) whenever two frames' links must change
//! together. This is finer-grained than the original but preserves its one
//! load-bearing invariant: these critical sections are always short and
//! never held across a sleep (see DESIGN.md).

use crate::{
    blockid::BlockId,
    collab::NodePlugin,
    frame::{next_seq, Frame, FrameFlags},
    slum::{self, Slum},
    txn::Atom,
};
use parking_lot::MutexGuard;
use std::sync::{Arc, Weak};

fn lock_pair<'a>(a: &'a Arc<Frame>, b: &'a Arc<Frame>) -> (MutexGuard<'a, crate::frame::TreeLinks>, MutexGuard<'a, crate::frame::TreeLinks>) {
    if a.seq <= b.seq {
        let ga = a.tree.lock();
        let gb = b.tree.lock();
        (ga, gb)
    } else {
        let gb = b.tree.lock();
        let ga = a.tree.lock();
        (ga, gb)
    }
}

pub fn link_siblings(left: &Arc<Frame>, right: &Arc<Frame>) {
    let (mut gl, mut gr) = lock_pair(left, right);
    gl.right = Some(Arc::downgrade(right));
    gr.left = Some(Arc::downgrade(left));
}

pub fn set_parent(child: &Arc<Frame>, parent: &Arc<Frame>, pos: u32) {
    let mut links = child.tree.lock();
    links.parent = Some(Arc::downgrade(parent));
    links.parent_pos = pos;
}

pub fn connect(frame: &Arc<Frame>) {
    frame.tree.lock().connected = true;
}

pub fn is_connected(frame: &Arc<Frame>) -> bool {
    frame.tree.lock().connected
}

fn right_of(f: &Arc<Frame>) -> Option<Arc<Frame>> {
    f.tree.lock().right.as_ref().and_then(Weak::upgrade)
}

/// A sentinel standing in for the conceptual parent of the root, so that
/// locking the root has the same shape as locking any other frame. Capture
/// is always skipped for it (SPEC_FULL.md 4.5).
pub fn make_above_root(super_id: u32) -> Arc<Frame> {
    let f = Frame::new(next_seq(), BlockId::new(super_id, i64::MIN));
    f.set_flag(FrameFlags::ABOVE_ROOT);
    connect(&f);
    f
}

pub fn is_above_root(frame: &Arc<Frame>) -> bool {
    frame.has_flag(FrameFlags::ABOVE_ROOT)
}

/// Join a newly-dirtied, write-locked, connected node to a slum
/// (SPEC_FULL.md 4.4 `add_to_slum`). The four-case decision on sibling
/// eligibility mirrors `slum_track.c`.
pub fn add_to_slum(node: &Arc<Frame>, atom: &Arc<Atom>, plugin: &dyn NodePlugin) {
    let (left, right) = {
        let links = node.tree.lock();
        (
            links.left.as_ref().and_then(Weak::upgrade),
            links.right.as_ref().and_then(Weak::upgrade),
        )
    };
    let node_atom = Some(Arc::clone(atom));
    let left_slum = left
        .as_ref()
        .and_then(|l| slum::neighbor_eligible(&l.tree.lock().slum.clone(), &node_atom));
    let right_slum = right
        .as_ref()
        .and_then(|r| slum::neighbor_eligible(&r.tree.lock().slum.clone(), &node_atom));
    let space = plugin.free_space(node);
    // mirrors `znode_save_free_space`: the plugin caches this figure on the
    // node itself so a later `remove_from_slum` recovers the value a node
    // had when it joined, not whatever its free space has drifted to since.
    plugin.save_free_space(node, space);

    let joined = match (left_slum, right_slum) {
        (None, None) => Slum::new(Some(Arc::clone(atom)), node, space),
        (None, Some(rs)) => {
            rs.add_node(space);
            rs.set_leftmost(node);
            rs
        }
        (Some(ls), None) => {
            ls.add_node(space);
            ls
        }
        (Some(ls), Some(rs)) if Arc::ptr_eq(&ls, &rs) => {
            ls.add_node(space);
            ls
        }
        (Some(ls), Some(rs)) => {
            let merged = slum::merge_slums(&ls, &rs, right_of);
            merged.add_node(space);
            merged
        }
    };
    node.tree.lock().slum = Some(joined);
}

/// Called for every frame at the boundary between two fusing atoms
/// (SPEC_FULL.md 4.4 `slum_merge_neighbors`): merges in any adjacent slum
/// that now shares the same (post-fusion) atom, then repoints this frame's
/// own slum at the growing atom unconditionally.
pub fn slum_merge_neighbors(node: &Arc<Frame>, growing: &Arc<Atom>) {
    let Some(mut current) = node.tree.lock().slum.clone() else {
        return;
    };
    if current.is_being_squeezed() {
        return;
    }
    let (left, right) = {
        let links = node.tree.lock();
        (
            links.left.as_ref().and_then(Weak::upgrade),
            links.right.as_ref().and_then(Weak::upgrade),
        )
    };
    if let Some(r) = &right {
        if let Some(rs) = r.tree.lock().slum.clone() {
            let shares_growing = rs.atom().map_or(false, |a| Arc::ptr_eq(&a, growing));
            if !Arc::ptr_eq(&rs, &current) && !rs.is_being_squeezed() && shares_growing {
                current = slum::merge_slums(&current, &rs, right_of);
            }
        }
    }
    if let Some(l) = &left {
        if let Some(ls) = l.tree.lock().slum.clone() {
            let shares_growing = ls.atom().map_or(false, |a| Arc::ptr_eq(&a, growing));
            if !Arc::ptr_eq(&ls, &current) && !ls.is_being_squeezed() && shares_growing {
                current = slum::merge_slums(&ls, &current, right_of);
            }
        }
    }
    current.set_atom(Some(Arc::clone(growing)));
}

/// Remove `frame` from its slum (`delete_node_from_slum`), e.g. once it is
/// flushed clean or deleted. Must be called before [`forget`] detaches the
/// sibling links this function uses to find the new leftmost.
pub fn remove_from_slum(frame: &Arc<Frame>, free_space: u32) {
    let slum = frame.tree.lock().slum.take();
    let Some(slum) = slum else {
        return;
    };
    let was_leftmost = slum.leftmost().map_or(false, |lm| Arc::ptr_eq(&lm, frame));
    let remaining = slum.remove_node(free_space);
    if remaining > 0 && was_leftmost {
        if let Some(next) = right_of(frame) {
            slum.set_leftmost(&next);
        }
    }
}

/// Detach `frame` from the sibling chain. Called once an invalidated,
/// write-locked frame's last lock has drained (SPEC_FULL.md 4.2 "forget").
pub fn forget(frame: &Arc<Frame>) {
    let (left, right) = {
        let mut links = frame.tree.lock();
        links.connected = false;
        (links.left.take(), links.right.take())
    };
    let left = left.and_then(|w| w.upgrade());
    let right = right.and_then(|w| w.upgrade());
    match (left, right) {
        (Some(l), Some(r)) => {
            let (mut gl, mut gr) = lock_pair(&l, &r);
            gl.right = Some(Arc::downgrade(&r));
            gr.left = Some(Arc::downgrade(&l));
        }
        (Some(l), None) => l.tree.lock().right = None,
        (None, Some(r)) => r.tree.lock().left = None,
        (None, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockid::BlockId;

    struct FixedSpace(u32);
    impl NodePlugin for FixedSpace {
        fn free_space(&self, _frame: &Arc<Frame>) -> u32 {
            self.0
        }
        fn save_free_space(&self, _frame: &Arc<Frame>, _space: u32) {}
    }

    #[test]
    fn dirtying_adjacent_nodes_merges_their_slums() {
        let atom = Atom::begin(1);
        let a = Frame::new(next_seq(), BlockId::new(1, 1));
        let b = Frame::new(next_seq(), BlockId::new(1, 2));
        let c = Frame::new(next_seq(), BlockId::new(1, 3));
        link_siblings(&a, &b);
        link_siblings(&b, &c);
        let plugin = FixedSpace(10);

        add_to_slum(&a, &atom, &plugin);
        add_to_slum(&c, &atom, &plugin);
        let slum_a = a.tree.lock().slum.clone().unwrap();
        let slum_c = c.tree.lock().slum.clone().unwrap();
        assert!(!Arc::ptr_eq(&slum_a, &slum_c));

        add_to_slum(&b, &atom, &plugin);
        let slum_a = a.tree.lock().slum.clone().unwrap();
        let slum_b = b.tree.lock().slum.clone().unwrap();
        let slum_c = c.tree.lock().slum.clone().unwrap();
        assert!(Arc::ptr_eq(&slum_a, &slum_b));
        assert!(Arc::ptr_eq(&slum_b, &slum_c));
        assert_eq!(slum_a.num_nodes(), 3);
        assert!(Arc::ptr_eq(&slum_a.leftmost().unwrap(), &a));
    }

    #[test]
    fn merging_slums_does_not_overwrite_a_clean_node_past_the_boundary() {
        let atom = Atom::begin(1);
        let a = Frame::new(next_seq(), BlockId::new(1, 1));
        let b = Frame::new(next_seq(), BlockId::new(1, 2));
        let c = Frame::new(next_seq(), BlockId::new(1, 3));
        let d = Frame::new(next_seq(), BlockId::new(1, 4));
        link_siblings(&a, &b);
        link_siblings(&b, &c);
        link_siblings(&c, &d);
        let plugin = FixedSpace(10);

        add_to_slum(&a, &atom, &plugin);
        add_to_slum(&c, &atom, &plugin);
        // dirtying b merges a's and c's slums; d was never dirtied and must
        // keep its own (absent) slum pointer untouched by that merge.
        add_to_slum(&b, &atom, &plugin);

        let slum = b.tree.lock().slum.clone().unwrap();
        assert_eq!(slum.num_nodes(), 3);
        assert!(Arc::ptr_eq(&a.tree.lock().slum.clone().unwrap(), &slum));
        assert!(Arc::ptr_eq(&c.tree.lock().slum.clone().unwrap(), &slum));
        assert!(d.tree.lock().slum.is_none());
    }

    #[test]
    fn forget_unlinks_from_both_neighbors() {
        let a = Frame::new(next_seq(), BlockId::new(1, 1));
        let b = Frame::new(next_seq(), BlockId::new(1, 2));
        let c = Frame::new(next_seq(), BlockId::new(1, 3));
        link_siblings(&a, &b);
        link_siblings(&b, &c);
        forget(&b);
        assert!(Arc::ptr_eq(&right_of(&a).unwrap(), &c));
        assert!(a.tree.lock().right.is_some());
        assert!(c.tree.lock().left.is_some());
    }
}
