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

mod atom;
mod handle;
mod mgr;

pub use atom::{Atom, AtomStage};
pub use handle::Handle;
pub use mgr::{CaptureForHandle, CaptureMode, TxnMgr};

use parking_lot::Mutex;
use std::sync::Arc;

/// The one-level indirection every frame and handle carries so fusion can
/// rewrite atom membership by updating a single pointer per member
/// (SPEC_FULL.md 9). Reads always happen under a lock the caller already
/// holds (the frame lock or the handle's exclusive use by its own thread),
/// so a plain mutex is enough here; there is no hot lock-free path to
/// justify the epoch-based `TMCell` the teacher uses for its analogous
/// interior-mutable handle (see DESIGN.md).
pub struct AtomUnion(Mutex<Option<Arc<Atom>>>);

impl AtomUnion {
    pub fn new() -> Self {
        Self(Mutex::new(None))
    }
    pub fn get(&self) -> Option<Arc<Atom>> {
        self.0.lock().clone()
    }
    pub fn set(&self, atom: Option<Arc<Atom>>) {
        *self.0.lock() = atom;
    }
}

impl Default for AtomUnion {
    fn default() -> Self {
        Self::new()
    }
}
