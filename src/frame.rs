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

//! The frame (a.k.a. znode): the unit of buffering, locking and capture.

use crate::{blockid::BlockId, lock::LockState, slum::Slum, txn::AtomUnion};
use parking_lot::{Condvar, Mutex};
use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc, Weak,
};

/// Flag bits, grouped the way the original znode state word groups them.
/// Groups are independent of each other; within a group at most one bit
/// should be set at a time (enforced by the setters, not by the type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u32);

impl FrameFlags {
    // visibility
    pub const IN_HASH: u32 = 1 << 0;
    pub const COPIED_OUT: u32 = 1 << 1;
    // busyness
    pub const READ_IN_PROGRESS: u32 = 1 << 2;
    pub const COPY_IN_PROGRESS: u32 = 1 << 3;
    /// transient: a copy is being spliced in under this blockid; the
    /// replacer must not pick this frame (resolves the source's "retry
    /// with refcount 0" open question, see SPEC_FULL.md 9).
    pub const COPY_PENDING: u32 = 1 << 4;
    // capture
    pub const CAPTIVE: u32 = 1 << 5;
    pub const INACTIVE: u32 = 1 << 6;
    // modification
    pub const ALLOCATED: u32 = 1 << 7;
    pub const RELOCATED: u32 = 1 << 8;
    pub const WANDERED: u32 = 1 << 9;
    pub const DELETED: u32 = 1 << 10;
    pub const DIRTY: u32 = 1 << 11;
    pub const WRITEOUT: u32 = 1 << 12;
    /// "heard banshee": marked for death, draining lock waiters.
    pub const DYING: u32 = 1 << 13;
    /// the sentinel standing in for the root's parent (SPEC_FULL.md 4.5);
    /// capture is skipped for this one frame.
    pub const ABOVE_ROOT: u32 = 1 << 14;

    pub fn empty() -> Self {
        Self(0)
    }
    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }
    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }
    pub fn clear(&mut self, bit: u32) {
        self.0 &= !bit;
    }
}

/// Sibling/parent/slum bookkeeping. Mutated only while the tree lock
/// ([`crate::tree::Tree`]) is held; never examined while sleeping.
#[derive(Debug, Default)]
pub struct TreeLinks {
    pub left: Option<Weak<Frame>>,
    pub right: Option<Weak<Frame>>,
    pub parent: Option<Weak<Frame>>,
    pub parent_pos: u32,
    pub connected: bool,
    pub slum: Option<Arc<Slum>>,
}

/// The in-memory descriptor of one cached block.
pub struct Frame {
    pub blockid: Mutex<BlockId>,
    pub relocid: Mutex<Option<BlockId>>,
    pub buffer: Mutex<Option<Vec<u8>>>,
    pub refcount: AtomicI64,
    pub flags: Mutex<FrameFlags>,
    pub lock_state: Mutex<LockState>,
    /// Notified whenever the requestors list becomes empty; see [`crate::lock::invalidate`].
    pub drain_cv: Condvar,
    pub tree: Mutex<TreeLinks>,
    pub atom: AtomUnion,
    /// monotone id, used only to break ties when ordering two frames for
    /// lock acquisition order (mirrors address-ordering on a real pointer).
    pub seq: u64,
}

impl Frame {
    pub fn new(seq: u64, blockid: BlockId) -> Arc<Self> {
        Arc::new(Self {
            blockid: Mutex::new(blockid),
            relocid: Mutex::new(None),
            buffer: Mutex::new(None),
            refcount: AtomicI64::new(0),
            flags: Mutex::new(FrameFlags::empty()),
            lock_state: Mutex::new(LockState::default()),
            drain_cv: Condvar::new(),
            tree: Mutex::new(TreeLinks::default()),
            atom: AtomUnion::new(),
            seq,
        })
    }

    pub fn blockid(&self) -> BlockId {
        *self.blockid.lock()
    }

    pub fn inc_ref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the post-decrement refcount.
    pub fn dec_ref(&self) -> i64 {
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags.lock().contains(bit)
    }

    pub fn set_flag(&self, bit: u32) {
        self.flags.lock().set(bit);
    }

    pub fn clear_flag(&self, bit: u32) {
        self.flags.lock().clear(bit);
    }

    /// Clean, unreferenced, uncaptured, not busy: eligible for replacement.
    pub fn can_inactivate(&self) -> bool {
        let flags = self.flags.lock();
        const BUSY: u32 = FrameFlags::READ_IN_PROGRESS
            | FrameFlags::COPY_IN_PROGRESS
            | FrameFlags::COPY_PENDING;
        self.refcount() == 0
            && !flags.contains(BUSY)
            && !flags.contains(FrameFlags::CAPTIVE)
            && !flags.contains(FrameFlags::DIRTY)
    }
}

/// Orders two frames by their allocation sequence, the Rust analogue of the
/// original's "order by pointer value" rule used whenever two frame-scoped
/// locks must be taken together.
pub fn order_pair<'a>(a: &'a Arc<Frame>, b: &'a Arc<Frame>) -> (&'a Arc<Frame>, &'a Arc<Frame>) {
    if a.seq <= b.seq {
        (a, b)
    } else {
        (b, a)
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_frame_is_inactivatable() {
        let f = Frame::new(next_seq(), BlockId::new(0, -1));
        assert!(f.can_inactivate());
        f.inc_ref();
        assert!(!f.can_inactivate());
    }

    #[test]
    fn dirty_frame_is_not_inactivatable() {
        let f = Frame::new(next_seq(), BlockId::new(0, -1));
        f.set_flag(FrameFlags::DIRTY);
        assert!(!f.can_inactivate());
    }
}
