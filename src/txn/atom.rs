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

use super::handle::Handle;
use crate::{blockid::BlockId, frame::Frame};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AtomStage {
    CaptureFuse,
    CaptureWait,
    PreCommit,
    PostCommit,
}

pub(super) struct AtomInner {
    pub stage: AtomStage,
    pub start_time: u64,
    pub capture_list: Vec<Weak<Frame>>,
    pub active_handles: Vec<Weak<Handle>>,
    /// Handles blocked on this atom leaving `CaptureWait` (SPEC_FULL.md 4.3 fuse-wait).
    pub fwaitfor: Vec<Weak<Handle>>,
    /// This atom's own handles, blocked on some other atom.
    pub fwaiting: Vec<Weak<Handle>>,
    pub writeout_inflight: u32,
    pub preserve_set: Vec<BlockId>,
    pub freespace_set: Vec<BlockId>,
}

/// A transactional unit: the set of frames and handles committed together.
pub struct Atom {
    pub id: u64,
    pub super_id: u32,
    pub(super) inner: Mutex<AtomInner>,
}

static NEXT_ATOM_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_START_TIME: AtomicU64 = AtomicU64::new(1);

impl Atom {
    pub fn begin(super_id: u32) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ATOM_ID.fetch_add(1, Ordering::Relaxed),
            super_id,
            inner: Mutex::new(AtomInner {
                stage: AtomStage::CaptureFuse,
                start_time: NEXT_START_TIME.fetch_add(1, Ordering::Relaxed),
                capture_list: Vec::new(),
                active_handles: Vec::new(),
                fwaitfor: Vec::new(),
                fwaiting: Vec::new(),
                writeout_inflight: 0,
                preserve_set: Vec::new(),
                freespace_set: Vec::new(),
            }),
        })
    }

    pub fn stage(&self) -> AtomStage {
        self.inner.lock().stage
    }

    /// `active_handles.len() + capture_list.len()`: the fusion-cost metric
    /// used to decide which of two fusing atoms absorbs the other
    /// (`txnmgr_atom_pointer_count` in the reference implementation).
    pub fn pointer_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.active_handles.len() + inner.capture_list.len()
    }

    pub(super) fn add_capture(self: &Arc<Self>, frame: &Arc<Frame>) {
        let mut inner = self.inner.lock();
        inner.capture_list.push(Arc::downgrade(frame));
    }

    pub(super) fn add_handle(self: &Arc<Self>, handle: &Arc<Handle>) {
        let mut inner = self.inner.lock();
        inner.active_handles.push(Arc::downgrade(handle));
    }

    pub(super) fn remove_capture(&self, frame: &Arc<Frame>) {
        let mut inner = self.inner.lock();
        inner.capture_list.retain(|w| w.upgrade().map_or(false, |f| !Arc::ptr_eq(&f, frame)));
    }

    /// Deregister `handle` from this atom's active-handle list. Returns the
    /// number of active handles remaining, so the caller can tell whether
    /// this was the last one keeping the atom open for new captures.
    pub(super) fn remove_handle(&self, handle: &Arc<Handle>) -> usize {
        let mut inner = self.inner.lock();
        inner.active_handles.retain(|w| w.upgrade().map_or(false, |h| !Arc::ptr_eq(&h, handle)));
        inner.active_handles.len()
    }

    pub(super) fn push_freespace(&self, block: BlockId) {
        self.inner.lock().freespace_set.push(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_count_counts_live_members() {
        let atom = Atom::begin(1);
        assert_eq!(atom.pointer_count(), 0);
        let f = Frame::new(crate::frame::next_seq(), BlockId::new(1, -1));
        atom.add_capture(&f);
        assert_eq!(atom.pointer_count(), 1);
    }
}
