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

//! The block cache (SPEC_FULL.md 4.1): maps `(super, block#) -> Frame` for
//! one mounted superblock, runs approximate-LRU replacement, and performs
//! copy-on-capture for the transaction manager.
//!
//! A frame's resident buffer is a plain `Vec<u8>` rather than a slot carved
//! out of a fixed arena — idiomatic for a Rust library with no custom
//! allocator, and behaviorally equivalent: "free a buffer" here means
//! "evict a frame from the hash", which is exactly the inactive-queue scan
//! below.

use crate::{
    blockid::{BlockId, FreshIdGen},
    collab::BlockIo,
    config::EngineConfig,
    error::{Error, ErrorKind, Result, Subsystem},
    frame::{next_seq, Frame, FrameFlags},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

pub struct Cache {
    super_id: u32,
    hash: Mutex<HashMap<BlockId, Arc<Frame>>>,
    inactive: Mutex<VecDeque<Arc<Frame>>>,
    replacer_lock: Mutex<()>,
    readin_lock: Mutex<()>,
    readin_cv: Condvar,
    fresh_ids: FreshIdGen,
    config: EngineConfig,
    io: Arc<dyn BlockIo>,
}

impl Cache {
    pub fn new(super_id: u32, config: EngineConfig, io: Arc<dyn BlockIo>) -> Arc<Self> {
        Arc::new(Self {
            super_id,
            hash: Mutex::new(HashMap::with_capacity(config.bucket_count())),
            inactive: Mutex::new(VecDeque::new()),
            replacer_lock: Mutex::new(()),
            readin_lock: Mutex::new(()),
            readin_cv: Condvar::new(),
            fresh_ids: FreshIdGen::new(super_id),
            config,
            io,
        })
    }

    pub fn super_id(&self) -> u32 {
        self.super_id
    }

    /// Fetch-or-read-in the frame for `blockid`. Retries internally on the
    /// benign "lost the insert race" case; returns `Retry` only when the
    /// frame was mid copy-on-capture (the caller's enclosing capture loop
    /// restarts and finds the spliced-in copy).
    pub fn get(self: &Arc<Self>, blockid: BlockId) -> Result<Arc<Frame>> {
        loop {
            if let Some(f) = self.hash.lock().get(&blockid).cloned() {
                f.inc_ref();
                if f.has_flag(FrameFlags::COPIED_OUT) {
                    f.dec_ref();
                    return Err(Error::retry(Subsystem::Cache));
                }
                self.wait_for_readin(&f);
                self.unqueue_inactive(&f);
                return Ok(f);
            }

            self.ensure_capacity();
            let frame = Frame::new(next_seq(), blockid);
            frame.inc_ref();
            frame.set_flag(FrameFlags::IN_HASH);
            frame.set_flag(FrameFlags::READ_IN_PROGRESS);
            {
                let mut map = self.hash.lock();
                if map.contains_key(&blockid) {
                    continue; // lost the insert race; retry the lookup
                }
                map.insert(blockid, Arc::clone(&frame));
            }
            let bytes = self.io.schedule_read(blockid)?;
            *frame.buffer.lock() = Some(bytes);
            frame.clear_flag(FrameFlags::READ_IN_PROGRESS);
            let _g = self.readin_lock.lock();
            self.readin_cv.notify_all();
            return Ok(frame);
        }
    }

    fn wait_for_readin(&self, f: &Arc<Frame>) {
        loop {
            if !f.has_flag(FrameFlags::READ_IN_PROGRESS) {
                return;
            }
            let mut g = self.readin_lock.lock();
            if f.has_flag(FrameFlags::READ_IN_PROGRESS) {
                self.readin_cv.wait(&mut g);
            }
        }
    }

    fn unqueue_inactive(&self, f: &Arc<Frame>) {
        let mut q = self.inactive.lock();
        if let Some(pos) = q.iter().position(|x| Arc::ptr_eq(x, f)) {
            q.remove(pos);
            f.clear_flag(FrameFlags::INACTIVE);
        }
    }

    /// Decrement refcount; when it reaches zero and the frame has nothing
    /// pinning it in memory, queue it as a replacement candidate.
    pub fn put(&self, frame: &Arc<Frame>) {
        let left = frame.dec_ref();
        if left == 0 && frame.can_inactivate() {
            frame.set_flag(FrameFlags::INACTIVE);
            self.inactive.lock().push_back(Arc::clone(frame));
        }
    }

    /// A fresh, unmapped, write-capture-ready frame with a descending
    /// negative block number.
    pub fn create(self: &Arc<Self>) -> Arc<Frame> {
        self.ensure_capacity();
        let blockid = self.fresh_ids.next();
        let frame = Frame::new(next_seq(), blockid);
        frame.set_flag(FrameFlags::IN_HASH);
        frame.set_flag(FrameFlags::ALLOCATED);
        self.hash.lock().insert(blockid, Arc::clone(&frame));
        frame
    }

    /// Move a fresh frame to its real, allocated block-id.
    pub fn remap(&self, frame: &Arc<Frame>, new_id: BlockId) -> Result<()> {
        let old_id = frame.blockid();
        if !old_id.is_fresh() {
            return Err(Error::with_kind(ErrorKind::Invalid));
        }
        let mut map = self.hash.lock();
        map.remove(&old_id);
        *frame.blockid.lock() = new_id;
        map.insert(new_id, Arc::clone(frame));
        Ok(())
    }

    /// Copy-on-capture: splice a fresh frame bearing `orig`'s block-id into
    /// the hash, populate it from `orig`'s buffer, and mark `orig` copied
    /// out (no longer reachable by block-id lookup).
    pub fn copy(self: &Arc<Self>, orig: &Arc<Frame>) -> Result<Arc<Frame>> {
        let blockid = orig.blockid();
        orig.set_flag(FrameFlags::COPY_PENDING);
        let copy = Frame::new(next_seq(), blockid);
        copy.inc_ref();
        copy.set_flag(FrameFlags::IN_HASH);
        copy.set_flag(FrameFlags::READ_IN_PROGRESS);
        self.hash.lock().insert(blockid, Arc::clone(&copy));
        let bytes = orig.buffer.lock().clone();
        *copy.buffer.lock() = bytes;
        copy.clear_flag(FrameFlags::READ_IN_PROGRESS);
        {
            let _g = self.readin_lock.lock();
            self.readin_cv.notify_all();
        }
        orig.clear_flag(FrameFlags::IN_HASH);
        orig.clear_flag(FrameFlags::COPY_PENDING);
        orig.set_flag(FrameFlags::COPIED_OUT);
        Ok(copy)
    }

    /// Move a captured frame from its pre-commit blockid to its relocid in
    /// the hash (SPEC_FULL.md 4.3 commit start, "update hash mapping from
    /// old blockid to relocid"). Unlike [`Self::remap`] this has no
    /// fresh-blockid precondition: it is used for both a brand-new frame's
    /// first real location and an existing block's relocation alike.
    pub(crate) fn reinsert(&self, frame: &Arc<Frame>, new_id: BlockId) {
        let old_id = frame.blockid();
        let mut map = self.hash.lock();
        map.remove(&old_id);
        *frame.blockid.lock() = new_id;
        map.insert(new_id, Arc::clone(frame));
    }

    /// Remove a dying or deleted frame from the hash outright, bypassing the
    /// inactive queue. Called by the integration layer once a frame's last
    /// lock has drained (SPEC_FULL.md 4.2 "forget") or a delete has landed.
    pub fn forget(&self, frame: &Arc<Frame>) {
        let bid = frame.blockid();
        self.hash.lock().remove(&bid);
        self.unqueue_inactive(frame);
        *frame.buffer.lock() = None;
        frame.clear_flag(FrameFlags::IN_HASH);
    }

    /// Evict inactive, unreferenced frames until the hash is back under
    /// `page_count`. Only one thread runs the scan at a time. Panics (an
    /// `InvariantViolation`) if the inactive queue is exhausted with the
    /// cache still over capacity — a well-sized cache never hits this.
    fn ensure_capacity(&self) {
        while self.hash.lock().len() >= self.config.page_count {
            let _replacer = self.replacer_lock.lock();
            if self.hash.lock().len() < self.config.page_count {
                return;
            }
            if !self.replace_one() {
                Error::bug("block cache replacement exhausted: no evictable frame");
            }
        }
    }

    fn replace_one(&self) -> bool {
        let mut inactive = self.inactive.lock();
        let scan_budget = inactive.len();
        for _ in 0..scan_budget {
            let Some(candidate) = inactive.pop_front() else {
                break;
            };
            if candidate.refcount() != 0 || !candidate.can_inactivate() {
                continue;
            }
            let Some(flags_guard) = candidate.flags.try_lock() else {
                continue;
            };
            drop(flags_guard);
            let bid = candidate.blockid();
            self.hash.lock().remove(&bid);
            *candidate.buffer.lock() = None;
            candidate.clear_flag(FrameFlags::IN_HASH);
            candidate.clear_flag(FrameFlags::INACTIVE);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::BlockIo;

    struct MemIo;
    impl BlockIo for MemIo {
        fn schedule_write(&self, _b: BlockId, _bytes: Vec<u8>) -> Result<()> {
            Ok(())
        }
        fn schedule_read(&self, _b: BlockId) -> Result<Vec<u8>> {
            Ok(vec![0u8; 16])
        }
    }

    fn cache(page_count: usize) -> Arc<Cache> {
        Cache::new(1, EngineConfig::new(page_count), Arc::new(MemIo))
    }

    #[test]
    fn create_then_get_round_trips() {
        let c = cache(8);
        let f = c.create();
        assert!(f.blockid().is_fresh());
        c.remap(&f, BlockId::new(1, 42)).unwrap();
        f.inc_ref();
        let got = c.get(BlockId::new(1, 42)).unwrap();
        assert!(Arc::ptr_eq(&f, &got));
    }

    #[test]
    fn put_queues_clean_unreferenced_frame_as_inactive() {
        let c = cache(8);
        let f = c.get(BlockId::new(1, 1)).unwrap();
        c.put(&f);
        assert!(f.has_flag(FrameFlags::INACTIVE));
    }

    #[test]
    fn copy_detaches_original_from_hash() {
        let c = cache(8);
        let orig = c.get(BlockId::new(1, 5)).unwrap();
        let copy = c.copy(&orig).unwrap();
        assert!(orig.has_flag(FrameFlags::COPIED_OUT));
        assert_eq!(copy.blockid(), orig.blockid());
        let looked_up = c.get(BlockId::new(1, 5)).unwrap();
        assert!(Arc::ptr_eq(&looked_up, &copy));
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn replacement_exhaustion_panics() {
        let c = cache(1);
        let pinned = c.get(BlockId::new(1, 1)).unwrap();
        std::mem::forget(pinned); // keep refcount pinned so nothing is inactivatable
        let _ = c.get(BlockId::new(1, 2));
    }
}
