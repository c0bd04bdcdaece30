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

//! The external collaborator surface (SPEC_FULL.md 6/6.1): everything this
//! crate consumes but does not implement — the bitmap allocator, the
//! per-plugin free-space accounting, block I/O, and commit-record durability.
//! A host binds real implementations; tests bind in-memory doubles.

use crate::{blockid::BlockId, error::Result, frame::Frame};
use std::sync::Arc;

/// The on-disk space allocator.
pub trait Allocator: Send + Sync {
    fn allocate(&self, super_id: u32) -> Result<BlockId>;
    fn deallocate(&self, super_id: u32, block: BlockId) -> Result<()>;
}

/// Per-node-format free-space accounting, consulted by the slum tracker.
pub trait NodePlugin: Send + Sync {
    fn free_space(&self, frame: &Arc<Frame>) -> u32;
    fn save_free_space(&self, frame: &Arc<Frame>, space: u32);
}

/// Sibling/parent connectivity glue (tree navigation lives outside this crate).
pub trait SiblingGlue: Send + Sync {
    fn connected(&self, frame: &Arc<Frame>) -> bool;
    fn forget(&self, frame: &Arc<Frame>);
}

/// Raw block I/O.
pub trait BlockIo: Send + Sync {
    fn schedule_write(&self, block: BlockId, bytes: Vec<u8>) -> Result<()>;
    fn schedule_read(&self, block: BlockId) -> Result<Vec<u8>>;
}

/// Durable recording of one atom's commit (SPEC_FULL.md 4.3.1). Invoked once
/// per atom at the post-commit transition; byte layout of the record itself
/// is out of scope for this crate.
pub trait CommitSink: Send + Sync {
    fn write_commit_record(
        &self,
        atom_id: u64,
        relocations: &[(BlockId, BlockId)],
        deallocations: &[BlockId],
    ) -> Result<()>;
}
