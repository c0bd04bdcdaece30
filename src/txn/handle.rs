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

use super::atom::Atom;
use crate::lock::{LockOwner, Priority};
use parking_lot::{Condvar, Mutex};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A user-facing transaction scope ("transcrash"). Wraps the lock-manager's
/// [`LockOwner`] so that one handle is both "the set of locks I hold" and
/// "the atom I belong to" — the reference implementation keeps these as
/// separate structures (`lock_stack` and `txn_handle`) coordinated through
/// thread-local current-context; this crate passes an explicit [`Handle`]
/// everywhere instead (SPEC_FULL.md 9, "not thread-local").
pub struct Handle {
    id: u64,
    pub super_id: u32,
    pub(super) atom: Mutex<Option<Arc<Atom>>>,
    pub lock_owner: Arc<LockOwner>,
    woken: Mutex<bool>,
    woken_cv: Condvar,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

impl Handle {
    pub fn begin(super_id: u32) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            super_id,
            atom: Mutex::new(None),
            lock_owner: LockOwner::new(Priority::Low),
            woken: Mutex::new(false),
            woken_cv: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn atom(&self) -> Option<Arc<Atom>> {
        self.atom.lock().clone()
    }

    pub(super) fn set_atom(&self, atom: Option<Arc<Atom>>) {
        *self.atom.lock() = atom;
    }

    /// Used by fuse-wait (SPEC_FULL.md 4.3): sleep until another thread's
    /// fusion wakes every handle on the blocking atom's wait lists.
    pub(super) fn sleep(&self) {
        let mut w = self.woken.lock();
        while !*w {
            self.woken_cv.wait(&mut w);
        }
        *w = false;
    }

    pub(super) fn wake(&self) {
        let mut w = self.woken.lock();
        *w = true;
        self.woken_cv.notify_all();
    }
}
