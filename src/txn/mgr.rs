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

//! Capture decision table, atom fusion, and commit staging
//! (SPEC_FULL.md 4.3), grounded on
//! `examples/original_source/reiser4/fs/reiser4/bufmgr/txnmgr.c`.

use super::{
    atom::{Atom, AtomStage},
    handle::Handle,
};
use crate::{
    block::Cache,
    blockid::BlockId,
    collab::{Allocator, BlockIo, CommitSink},
    error::{Error, Result, Subsystem},
    frame::{Frame, FrameFlags},
    lock::{CaptureHook, LockMode},
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Read a committing block without copy; never blocks on commit.
    ReadAtomic,
    /// Read without establishing atom membership at all.
    ReadNonCommitting,
    /// Read, but join the owning atom (a prelude to a later write).
    ReadModify,
    Write,
}

impl CaptureMode {
    pub(crate) fn lock_mode(self) -> LockMode {
        match self {
            CaptureMode::Write => LockMode::Write,
            _ => LockMode::Read,
        }
    }
}

pub struct TxnMgr {
    cache: Arc<Cache>,
}

impl TxnMgr {
    pub fn new(cache: Arc<Cache>) -> Arc<Self> {
        Arc::new(Self { cache })
    }

    pub fn begin_handle(&self) -> Arc<Handle> {
        Handle::begin(self.cache.super_id())
    }

    /// The table in SPEC_FULL.md 4.3. Returns `Ok(())` once `frame` is
    /// correctly captured for `handle`'s purposes, or `Retry` when fusion,
    /// fuse-wait, or copy-on-capture means the whole operation (lock
    /// acquisition included) must restart from the top.
    pub fn capture_for(&self, handle: &Arc<Handle>, frame: &Arc<Frame>, mode: CaptureMode) -> Result<()> {
        let frame_atom = frame.atom.get();
        let handle_atom = handle.atom();
        match (frame_atom, handle_atom) {
            (None, None) => {
                if mode == CaptureMode::ReadNonCommitting {
                    return Ok(());
                }
                let atom = Atom::begin(self.cache.super_id());
                self.assign_frame(frame, &atom);
                self.assign_handle(handle, &atom);
                Ok(())
            }
            (None, Some(ha)) => {
                if mode == CaptureMode::ReadNonCommitting {
                    return Ok(());
                }
                self.assign_frame(frame, &ha);
                Ok(())
            }
            (Some(fa), None) => {
                if mode == CaptureMode::ReadNonCommitting {
                    return Ok(());
                }
                self.assign_handle(handle, &fa);
                Ok(())
            }
            (Some(fa), Some(ha)) => {
                if Arc::ptr_eq(&fa, &ha) {
                    return Ok(());
                }
                match fa.stage() {
                    AtomStage::PreCommit | AtomStage::PostCommit => {
                        if mode == CaptureMode::ReadAtomic {
                            return Ok(());
                        }
                        self.cache.copy(frame)?;
                        Err(Error::retry(Subsystem::Txn))
                    }
                    AtomStage::CaptureWait if ha.stage() != AtomStage::CaptureWait => {
                        self.fuse_wait(&fa, &ha, handle);
                        Err(Error::retry(Subsystem::Txn))
                    }
                    _ => {
                        self.init_fusion(fa, ha);
                        Err(Error::retry(Subsystem::Txn))
                    }
                }
            }
        }
    }

    fn assign_frame(&self, frame: &Arc<Frame>, atom: &Arc<Atom>) {
        frame.atom.set(Some(Arc::clone(atom)));
        atom.add_capture(frame);
        frame.set_flag(FrameFlags::CAPTIVE);
        frame.inc_ref();
    }

    fn assign_handle(&self, handle: &Arc<Handle>, atom: &Arc<Atom>) {
        handle.set_atom(Some(Arc::clone(atom)));
        atom.add_handle(handle);
    }

    /// Enqueue `handle` on both wait lists and block until fusion wakes it.
    fn fuse_wait(&self, frame_atom: &Arc<Atom>, handle_atom: &Arc<Atom>, handle: &Arc<Handle>) {
        {
            let mut fi = frame_atom.inner.lock();
            fi.fwaitfor.push(Arc::downgrade(handle));
        }
        {
            let mut hi = handle_atom.inner.lock();
            hi.fwaiting.push(Arc::downgrade(handle));
        }
        handle.sleep();
    }

    /// Merge two distinct atoms that share a captured frame or handle.
    /// Lock order is the atoms' monotone ids, matching
    /// `txnmgr_atom_lockorder` in the reference implementation.
    fn init_fusion(&self, a: Arc<Atom>, b: Arc<Atom>) {
        let (first, second) = if a.id < b.id { (a, b) } else { (b, a) };
        let (small, large) = if first.pointer_count() <= second.pointer_count() {
            (first, second)
        } else {
            (second, first)
        };
        self.fuse_into(&small, &large);
    }

    fn fuse_into(&self, small: &Arc<Atom>, large: &Arc<Atom>) {
        let mut small_inner = small.inner.lock();
        let mut large_inner = large.inner.lock();

        for weak in small_inner.capture_list.drain(..) {
            if let Some(frame) = weak.upgrade() {
                frame.atom.set(Some(Arc::clone(large)));
                large_inner.capture_list.push(Arc::downgrade(&frame));
            }
        }
        for weak in small_inner.active_handles.drain(..) {
            if let Some(handle) = weak.upgrade() {
                handle.set_atom(Some(Arc::clone(large)));
                large_inner.active_handles.push(Arc::downgrade(&handle));
            }
        }
        large_inner.start_time = large_inner.start_time.min(small_inner.start_time);
        large_inner.preserve_set.extend(small_inner.preserve_set.drain(..));
        large_inner.freespace_set.extend(small_inner.freespace_set.drain(..));

        let promote = small_inner.stage > large_inner.stage;
        if promote {
            large_inner.stage = small_inner.stage;
        }

        for weak in small_inner.fwaitfor.drain(..).chain(large_inner.fwaitfor.drain(..)) {
            if let Some(h) = weak.upgrade() {
                h.wake();
            }
        }
        for weak in small_inner.fwaiting.drain(..) {
            if let Some(h) = weak.upgrade() {
                h.wake();
            }
        }
        if promote {
            for weak in large_inner.fwaiting.drain(..) {
                if let Some(h) = weak.upgrade() {
                    h.wake();
                }
            }
        }
    }

    /// Deregister `handle` from its atom's active-handle list, then start
    /// committing the atom once no active handle remains joined to it
    /// (SPEC_FULL.md 9: fusion can join several handles to one atom, so the
    /// atom itself commits only once the last of them has called this).
    pub fn commit_handle(
        &self,
        handle: &Arc<Handle>,
        alloc: &dyn Allocator,
        io: &dyn BlockIo,
        sink: &dyn CommitSink,
    ) -> Result<()> {
        let Some(atom) = handle.atom() else {
            return Ok(());
        };
        handle.set_atom(None);
        if atom.remove_handle(handle) == 0 {
            self.commit_start(&atom, alloc, io, sink)
        } else {
            Ok(())
        }
    }

    /// Block delete (SPEC_FULL.md 4.3): marks `frame` deleted, cancels any
    /// in-flight writeout, folds its old/relocated locations into the atom's
    /// freespace set, and releases the capture reference.
    pub fn delete_capture(&self, atom: &Arc<Atom>, frame: &Arc<Frame>) {
        frame.set_flag(FrameFlags::DELETED);
        frame.clear_flag(FrameFlags::WRITEOUT);
        if !frame.has_flag(FrameFlags::ALLOCATED) {
            atom.push_freespace(frame.blockid());
        }
        if let Some(relocid) = frame.relocid.lock().take() {
            atom.push_freespace(relocid);
        }
        atom.remove_capture(frame);
        frame.atom.set(None);
        frame.clear_flag(FrameFlags::CAPTIVE);
        frame.dec_ref();
    }

    /// Begin commit: walk the capture list, schedule writes for dirty
    /// frames, release unmodified ones, and record relocations. Frees the
    /// atom synchronously when there is nothing left to write (SPEC_FULL.md
    /// 4.3.1, scenario S7); otherwise `on_write_complete` finishes the job.
    pub fn commit_start(
        &self,
        atom: &Arc<Atom>,
        alloc: &dyn Allocator,
        io: &dyn BlockIo,
        sink: &dyn CommitSink,
    ) -> Result<()> {
        let mut relocations = Vec::new();
        {
            let mut inner = atom.inner.lock();
            inner.stage = AtomStage::PreCommit;
            let members: Vec<_> = inner.capture_list.drain(..).filter_map(|w| w.upgrade()).collect();
            for frame in members {
                if !frame.has_flag(FrameFlags::DIRTY) {
                    frame.atom.set(None);
                    frame.clear_flag(FrameFlags::CAPTIVE);
                    frame.dec_ref();
                    continue;
                }
                let old_id = frame.blockid();
                let fresh = old_id.is_fresh();
                let relocid = alloc.allocate(atom.super_id)?;
                if !fresh {
                    // an already-real block moving to a new location: its old
                    // spot cannot be reused until this commit is durable.
                    inner.preserve_set.push(old_id);
                    frame.set_flag(FrameFlags::RELOCATED);
                }
                self.cache.reinsert(frame, relocid);
                *frame.relocid.lock() = Some(relocid);
                frame.set_flag(FrameFlags::WRITEOUT);
                frame.clear_flag(FrameFlags::DIRTY);
                // past its first commit the frame's location is real and
                // durable-pending, not a placeholder awaiting allocation.
                frame.clear_flag(FrameFlags::ALLOCATED);
                inner.writeout_inflight += 1;
                relocations.push((old_id, relocid));
                let bytes = frame.buffer.lock().clone().unwrap_or_default();
                io.schedule_write(relocid, bytes)?;
            }
        }
        self.maybe_finish_commit(atom, &relocations, alloc, sink)
    }

    /// I/O completion callback: drop the writeout reference and finish the
    /// atom once every scheduled write has landed.
    pub fn on_write_complete(&self, atom: &Arc<Atom>, frame: &Arc<Frame>, alloc: &dyn Allocator, sink: &dyn CommitSink) -> Result<()> {
        frame.clear_flag(FrameFlags::WRITEOUT);
        frame.clear_flag(FrameFlags::CAPTIVE);
        frame.atom.set(None);
        frame.dec_ref();
        let done = {
            let mut inner = atom.inner.lock();
            inner.writeout_inflight -= 1;
            inner.writeout_inflight == 0
        };
        if done {
            self.maybe_finish_commit(atom, &[], alloc, sink)
        } else {
            Ok(())
        }
    }

    /// Folds `preserve_set` (relocated frames' now-superseded old locations)
    /// into the deallocation set, records the commit, then actually frees
    /// every deallocated block through `alloc` (SPEC_FULL.md 4.3 "record old
    /// blockid for deallocation", SPEC_FULL.md 6 "the set of deallocations").
    fn maybe_finish_commit(
        &self,
        atom: &Arc<Atom>,
        relocations: &[(BlockId, BlockId)],
        alloc: &dyn Allocator,
        sink: &dyn CommitSink,
    ) -> Result<()> {
        let dealloc = {
            let mut inner = atom.inner.lock();
            if inner.writeout_inflight != 0 {
                return Ok(());
            }
            let preserved: Vec<_> = inner.preserve_set.drain(..).collect();
            inner.freespace_set.extend(preserved);
            inner.stage = AtomStage::PostCommit;
            inner.freespace_set.clone()
        };
        sink.write_commit_record(atom.id, relocations, &dealloc)?;
        for block in &dealloc {
            alloc.deallocate(atom.super_id, *block)?;
        }
        Ok(())
    }
}

/// Adapts [`TxnMgr`] to the lock manager's capture-then-lock composition
/// (SPEC_FULL.md 4.5): built fresh per call so it can close over the
/// requesting handle and capture mode.
pub struct CaptureForHandle<'a> {
    pub mgr: &'a TxnMgr,
    pub handle: &'a Arc<Handle>,
    pub mode: CaptureMode,
}

impl CaptureHook for CaptureForHandle<'_> {
    fn try_capture(&self, frame: &Arc<Frame>, _lock_mode: LockMode) -> Result<()> {
        self.mgr.capture_for(self.handle, frame, self.mode)
    }
}
