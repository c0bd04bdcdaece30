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

//! The public facade (SPEC_FULL.md 6): the one entry point a host filesystem
//! driver links against. Wires the block cache, lock manager, transaction
//! manager and slum tracker together behind the operations the rest of the
//! system is described in terms of.

use crate::{
    block::Cache,
    blockid::BlockId,
    collab::{Allocator, BlockIo, CommitSink, NodePlugin},
    config::EngineConfig,
    error::Result,
    frame::{Frame, FrameFlags},
    lock::{self, LockMode},
    tree,
    txn::{CaptureForHandle, CaptureMode, Handle, TxnMgr},
};
use std::sync::Arc;

/// One mounted superblock's worth of cache, lock manager, transaction
/// manager and slum tracker, plus the collaborators it was built with.
pub struct Engine {
    cache: Arc<Cache>,
    txn: Arc<TxnMgr>,
    alloc: Arc<dyn Allocator>,
    node_plugin: Arc<dyn NodePlugin>,
    io: Arc<dyn BlockIo>,
    sink: Arc<dyn CommitSink>,
    above_root: Arc<Frame>,
}

impl Engine {
    /// `cache_init` (SPEC_FULL.md 6): there is no CLI and no environment
    /// reader here, only an explicit config and the collaborators it needs.
    pub fn cache_init(
        super_id: u32,
        config: EngineConfig,
        io: Arc<dyn BlockIo>,
        alloc: Arc<dyn Allocator>,
        node_plugin: Arc<dyn NodePlugin>,
        sink: Arc<dyn CommitSink>,
    ) -> Arc<Self> {
        let cache = Cache::new(super_id, config, Arc::clone(&io));
        let txn = TxnMgr::new(Arc::clone(&cache));
        log::debug!("cowcore: engine initialized for super {super_id}");
        Arc::new(Self {
            cache,
            txn,
            alloc,
            node_plugin,
            io,
            sink,
            above_root: tree::make_above_root(super_id),
        })
    }

    pub fn txn_begin(&self) -> Arc<Handle> {
        self.txn.begin_handle()
    }

    /// The sentinel standing in for the conceptual parent of the root
    /// (SPEC_FULL.md 4.5): lock it exactly like any other frame to begin a
    /// top-down tree traversal.
    pub fn above_root(&self) -> &Arc<Frame> {
        &self.above_root
    }

    /// Commits `handle`. Once the last handle fused into its atom has
    /// committed, the atom itself begins commit staging (SPEC_FULL.md 4.3.1).
    pub fn txn_commit(&self, handle: &Arc<Handle>) -> Result<()> {
        self.txn.commit_handle(handle, self.alloc.as_ref(), self.io.as_ref(), self.sink.as_ref())
    }

    /// The central operation (SPEC_FULL.md 6): fetch-or-read-in, capture,
    /// lock — composed and retried as one unit, per §7's "Retry never
    /// escapes the library".
    pub fn capture(self: &Arc<Self>, handle: &Arc<Handle>, blockid: BlockId, mode: CaptureMode) -> Result<Arc<Frame>> {
        loop {
            let frame = match self.cache.get(blockid) {
                Ok(f) => f,
                Err(e) if e.is_retry() => continue,
                Err(e) => return Err(e),
            };
            let hook = CaptureForHandle { mgr: self.txn.as_ref(), handle, mode };
            match lock::acquire(&frame, &handle.lock_owner, mode.lock_mode(), &hook, false) {
                Ok(()) => return Ok(frame),
                Err(e) if e.is_retry() => {
                    self.cache.put(&frame);
                    continue;
                }
                Err(e) => {
                    self.cache.put(&frame);
                    return Err(e);
                }
            }
        }
    }

    /// `create` (SPEC_FULL.md 4.3 "Block create"): commits both the fresh
    /// frame and its write capture, or neither — on capture failure the
    /// fresh frame's reference is released rather than leaking it.
    pub fn create(self: &Arc<Self>, handle: &Arc<Handle>) -> Result<Arc<Frame>> {
        let frame = self.cache.create();
        let hook = CaptureForHandle { mgr: self.txn.as_ref(), handle, mode: CaptureMode::Write };
        match lock::acquire(&frame, &handle.lock_owner, LockMode::Write, &hook, false) {
            Ok(()) => Ok(frame),
            Err(e) => {
                self.cache.put(&frame);
                Err(e)
            }
        }
    }

    /// `delete` (SPEC_FULL.md 4.3 "Block delete"): caller must already hold
    /// the write lock obtained from [`capture`]/[`create`].
    pub fn delete(&self, handle: &Arc<Handle>, frame: &Arc<Frame>) -> Result<()> {
        if let Some(atom) = handle.atom() {
            self.txn.delete_capture(&atom, frame);
        }
        if tree::is_connected(frame) {
            tree::remove_from_slum(frame, self.node_plugin.free_space(frame));
        }
        Ok(())
    }

    /// `lock` (SPEC_FULL.md 6): composes with capture per §4.5 unless
    /// `frame` is the above-root sentinel, which skips capture entirely.
    pub fn lock(&self, frame: &Arc<Frame>, handle: &Arc<Handle>, mode: CaptureMode, nonblocking: bool) -> Result<()> {
        if tree::is_above_root(frame) {
            return lock::acquire(frame, &handle.lock_owner, mode.lock_mode(), &lock::NoCapture, nonblocking);
        }
        let hook = CaptureForHandle { mgr: self.txn.as_ref(), handle, mode };
        lock::acquire(frame, &handle.lock_owner, mode.lock_mode(), &hook, nonblocking)
    }

    /// `unlock` (SPEC_FULL.md 6). If this was the last lock on a frame
    /// marked dying, finishes evicting it: sibling unlink then hash removal
    /// (SPEC_FULL.md 4.2 "forget").
    pub fn unlock(&self, frame: &Arc<Frame>, handle: &Arc<Handle>, mode: LockMode) {
        let dying = lock::release(frame, &handle.lock_owner, mode);
        if dying {
            tree::forget(frame);
            self.cache.forget(frame);
        }
    }

    /// `invalidate` (SPEC_FULL.md 6): caller holds the write lock on a
    /// frame it has already marked dying and unlinked from tree state.
    pub fn invalidate(&self, frame: &Arc<Frame>, handle: &Arc<Handle>) -> Result<()> {
        lock::invalidate(frame, &handle.lock_owner)
    }

    /// `slum_on_dirty` (SPEC_FULL.md 6): notification hook from higher
    /// layers once a write-locked, connected frame's content is modified.
    pub fn slum_on_dirty(&self, frame: &Arc<Frame>) {
        frame.set_flag(FrameFlags::DIRTY);
        if !tree::is_connected(frame) {
            return;
        }
        let Some(atom) = frame.atom.get() else {
            return;
        };
        tree::add_to_slum(frame, &atom, self.node_plugin.as_ref());
    }

    /// `on_write_complete` (SPEC_FULL.md 6): I/O completion callback.
    pub fn on_write_complete(&self, frame: &Arc<Frame>) -> Result<()> {
        let Some(atom) = frame.atom.get() else {
            return Ok(());
        };
        self.txn.on_write_complete(&atom, frame, self.alloc.as_ref(), self.sink.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockid::BlockId;
    use std::sync::Mutex as StdMutex;

    struct MemIo;
    impl BlockIo for MemIo {
        fn schedule_write(&self, _b: BlockId, _bytes: Vec<u8>) -> Result<()> {
            Ok(())
        }
        fn schedule_read(&self, _b: BlockId) -> Result<Vec<u8>> {
            Ok(vec![0u8; 16])
        }
    }

    struct CountingAlloc {
        next: StdMutex<i64>,
    }
    impl Allocator for CountingAlloc {
        fn allocate(&self, super_id: u32) -> Result<BlockId> {
            let mut n = self.next.lock().unwrap();
            *n += 1;
            Ok(BlockId::new(super_id, *n))
        }
        fn deallocate(&self, _super_id: u32, _block: BlockId) -> Result<()> {
            Ok(())
        }
    }

    struct FixedPlugin;
    impl NodePlugin for FixedPlugin {
        fn free_space(&self, _frame: &Arc<Frame>) -> u32 {
            100
        }
        fn save_free_space(&self, _frame: &Arc<Frame>, _space: u32) {}
    }

    struct RecordingSink {
        committed: StdMutex<Vec<u64>>,
    }
    impl CommitSink for RecordingSink {
        fn write_commit_record(&self, atom_id: u64, _relocations: &[(BlockId, BlockId)], _deallocations: &[BlockId]) -> Result<()> {
            self.committed.lock().unwrap().push(atom_id);
            Ok(())
        }
    }

    fn engine() -> Arc<Engine> {
        Engine::cache_init(
            1,
            EngineConfig::new(64),
            Arc::new(MemIo),
            Arc::new(CountingAlloc { next: StdMutex::new(0) }),
            Arc::new(FixedPlugin),
            Arc::new(RecordingSink { committed: StdMutex::new(Vec::new()) }),
        )
    }

    #[test]
    fn create_write_commit_then_read_sees_bytes() {
        let e = engine();
        let h = e.txn_begin();
        let f = e.create(&h).unwrap();
        *f.buffer.lock() = Some(vec![0xAB; 16]);
        e.slum_on_dirty(&f);
        e.unlock(&f, &h, LockMode::Write);
        e.txn_commit(&h).unwrap();

        let h2 = e.txn_begin();
        let new_id = f.blockid();
        assert!(!new_id.is_fresh());
        let got = e.capture(&h2, new_id, CaptureMode::ReadAtomic).unwrap();
        assert_eq!(got.buffer.lock().as_ref().unwrap()[0], 0xAB);
    }

    #[test]
    fn commit_with_nothing_dirty_frees_synchronously() {
        let e = engine();
        let h = e.txn_begin();
        let f = e.capture(&h, BlockId::new(1, 1), CaptureMode::ReadModify).unwrap();
        e.unlock(&f, &h, LockMode::Read);
        e.txn_commit(&h).unwrap();
        assert!(f.atom.get().is_none());
    }
}
