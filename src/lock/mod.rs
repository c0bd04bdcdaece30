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

//! Long-term, priority-aware, multi-reader/single-writer frame locks.
//!
//! Two priority classes ([`Priority::High`]/[`Priority::Low`]) avoid deadlock
//! without a full wait-for graph: whenever a frame accumulates a
//! high-priority requestor and has no high-priority owner, every low-priority
//! owner of that frame is signaled; a signaled low-priority owner returns
//! [`crate::error::ErrorKind::Deadlock`] the next time it would block,
//! unwinds its own locks, and retries at high priority. This mirrors the
//! lock manager in `examples/original_source/reiser4/lock.c`.
//!
//! Capture-then-lock composition (SPEC_FULL.md 4.5) is expressed through the
//! [`CaptureHook`] trait: [`acquire`] calls it once compatibility is found,
//! and re-tests compatibility afterwards since capture may have released the
//! frame's internal lock.

use crate::{
    error::{Error, ErrorKind, Result, Subsystem},
    frame::Frame,
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Something capture-then-lock composition can call into before a lock is
/// granted (SPEC_FULL.md 4.5). The transaction manager implements this.
pub trait CaptureHook {
    fn try_capture(&self, frame: &Arc<Frame>, mode: LockMode) -> Result<()>;
}

/// A no-op hook for frames that never need capture (e.g. the above-root
/// sentinel, SPEC_FULL.md 4.5).
pub struct NoCapture;

impl CaptureHook for NoCapture {
    fn try_capture(&self, _frame: &Arc<Frame>, _mode: LockMode) -> Result<()> {
        Ok(())
    }
}

/// An owner-stack: one thread's set of currently-held long-term locks.
pub struct LockOwner {
    id: u64,
    priority: AtomicU8,
    signaled: AtomicU32,
    woken: Mutex<bool>,
    woken_cv: Condvar,
    held: Mutex<Vec<Arc<Frame>>>,
}

const PRIO_LOW: u8 = 0;
const PRIO_HIGH: u8 = 1;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

impl LockOwner {
    pub fn new(priority: Priority) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
            priority: AtomicU8::new(if priority == Priority::High { PRIO_HIGH } else { PRIO_LOW }),
            signaled: AtomicU32::new(0),
            woken: Mutex::new(false),
            woken_cv: Condvar::new(),
            held: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> Priority {
        if self.priority.load(Ordering::SeqCst) == PRIO_HIGH {
            Priority::High
        } else {
            Priority::Low
        }
    }

    pub fn signaled_count(&self) -> u32 {
        self.signaled.load(Ordering::SeqCst)
    }

    pub fn clear_signal(&self) {
        self.signaled.store(0, Ordering::SeqCst);
    }

    /// Ask this owner to yield its low-priority locks at its next chance.
    fn signal(&self) {
        self.signaled.fetch_add(1, Ordering::SeqCst);
        self.wake();
    }

    fn wake(&self) {
        let mut w = self.woken.lock();
        *w = true;
        self.woken_cv.notify_all();
    }

    fn sleep(&self) {
        let mut w = self.woken.lock();
        while !*w {
            self.woken_cv.wait(&mut w);
        }
        *w = false;
    }

    /// Walk every frame currently held by this owner, adjusting each frame's
    /// high-priority-owner count, then adopt the new priority. Promoting to
    /// high priority never creates a deadlock condition (it can only clear
    /// one); demoting to low priority can, so low-priority owners of the
    /// same frames are signaled in that case.
    pub fn set_priority(self: &Arc<Self>, new: Priority) {
        let old = self.priority();
        if old == new {
            return;
        }
        let held = self.held.lock();
        for frame in held.iter() {
            let mut ls = frame.lock_state.lock();
            match new {
                Priority::High => ls.hipri_owners += 1,
                Priority::Low => {
                    ls.hipri_owners = ls.hipri_owners.saturating_sub(1);
                    if ls.hipri_owners == 0 && ls.hipri_requestors > 0 {
                        signal_lopri_owners(&ls);
                    }
                }
            }
        }
        drop(held);
        self.priority.store(
            if new == Priority::High { PRIO_HIGH } else { PRIO_LOW },
            Ordering::SeqCst,
        );
        if new == Priority::High {
            // promoted out of the low-priority class this signal targets;
            // a stale count would otherwise make the very next acquire on
            // this owner return Deadlock again before it can retry.
            self.clear_signal();
        }
    }

    fn record_held(self: &Arc<Self>, frame: Arc<Frame>) {
        self.held.lock().push(frame);
    }

    fn forget_held(&self, frame: &Arc<Frame>) {
        self.held.lock().retain(|f| !Arc::ptr_eq(f, frame));
    }
}

/// The lock-manager-owned part of a [`Frame`]'s state.
#[derive(Default)]
pub struct LockState {
    /// > 0: N readers. < 0: write-lock recursion depth (as a negative count). 0: free.
    reader_count: i32,
    write_owner: Option<Arc<LockOwner>>,
    read_owners: Vec<Arc<LockOwner>>,
    requestors: VecDeque<Arc<LockOwner>>,
    hipri_owners: u32,
    hipri_requestors: u32,
    dying: bool,
}

impl LockState {
    fn deadlock_condition(&self) -> bool {
        self.hipri_requestors > 0 && self.hipri_owners == 0
    }

    fn is_recursive_writer(&self, owner: &Arc<LockOwner>) -> bool {
        self.write_owner.as_ref().map_or(false, |o| Arc::ptr_eq(o, owner))
    }
}

fn signal_lopri_owners(ls: &LockState) {
    if let Some(w) = &ls.write_owner {
        if w.priority() == Priority::Low {
            w.signal();
        }
    }
    for r in &ls.read_owners {
        if r.priority() == Priority::Low {
            r.signal();
        }
    }
}

/// Outcome of testing whether `owner` may hold `mode` on a frame right now.
enum Admit {
    Yes,
    No,
}

fn can_lock(ls: &LockState, mode: LockMode, owner: &Arc<LockOwner>) -> Result<Admit> {
    if ls.dying {
        return Err(Error::invalid(Subsystem::Lock));
    }
    if owner.priority() == Priority::Low && ls.deadlock_condition() {
        return Err(Error::deadlock(Subsystem::Lock));
    }
    let compatible = match mode {
        LockMode::Write => ls.reader_count == 0 || ls.is_recursive_writer(owner),
        LockMode::Read => ls.write_owner.is_none() || ls.is_recursive_writer(owner),
    };
    Ok(if compatible { Admit::Yes } else { Admit::No })
}

fn admit(ls: &mut LockState, owner: &Arc<LockOwner>, mode: LockMode) {
    match mode {
        LockMode::Write => {
            ls.reader_count -= 1;
            ls.write_owner = Some(Arc::clone(owner));
        }
        LockMode::Read => {
            ls.reader_count += 1;
            ls.read_owners.push(Arc::clone(owner));
        }
    }
    if owner.priority() == Priority::High {
        ls.hipri_owners += 1;
    }
}

fn remove_requestor(frame: &Frame, ls: &mut LockState, owner: &Arc<LockOwner>, is_hi: bool) {
    if let Some(pos) = ls.requestors.iter().position(|o| Arc::ptr_eq(o, owner)) {
        ls.requestors.remove(pos);
        if is_hi {
            ls.hipri_requestors = ls.hipri_requestors.saturating_sub(1);
        }
        if ls.requestors.is_empty() {
            frame.drain_cv.notify_all();
        }
    }
}

/// Acquire `mode` on `frame` for `owner`, composing with capture via `hook`
/// per SPEC_FULL.md 4.2/4.5. `nonblocking` maps to the `Busy` error kind
/// (SPEC_FULL.md 7) instead of sleeping.
pub fn acquire(
    frame: &Arc<Frame>,
    owner: &Arc<LockOwner>,
    mode: LockMode,
    hook: &dyn CaptureHook,
    nonblocking: bool,
) -> Result<()> {
    let is_hi = owner.priority() == Priority::High;
    let mut registered = false;
    let mut ls = frame.lock_state.lock();
    loop {
        match can_lock(&ls, mode, owner) {
            Err(e) => {
                if registered {
                    remove_requestor(frame, &mut ls, owner, is_hi);
                }
                return Err(e);
            }
            Ok(Admit::Yes) => {
                drop(ls);
                if let Err(e) = hook.try_capture(frame, mode) {
                    let mut ls = frame.lock_state.lock();
                    if registered {
                        remove_requestor(frame, &mut ls, owner, is_hi);
                    }
                    wake_front(&ls);
                    return Err(e);
                }
                ls = frame.lock_state.lock();
                match can_lock(&ls, mode, owner) {
                    Err(e) => {
                        if registered {
                            remove_requestor(frame, &mut ls, owner, is_hi);
                        }
                        return Err(e);
                    }
                    Ok(Admit::Yes) => {
                        admit(&mut ls, owner, mode);
                        if registered {
                            remove_requestor(frame, &mut ls, owner, is_hi);
                        }
                        let is_read = mode == LockMode::Read;
                        drop(ls);
                        owner.record_held(Arc::clone(frame));
                        if is_read {
                            let ls = frame.lock_state.lock();
                            wake_front(&ls);
                        }
                        return Ok(());
                    }
                    Ok(Admit::No) => {
                        // capture released and reacquired the frame lock; someone
                        // else got there first. fall through to the sleep path.
                    }
                }
            }
            Ok(Admit::No) => {}
        }
        if nonblocking {
            if registered {
                remove_requestor(frame, &mut ls, owner, is_hi);
            }
            return Err(Error::with_kind(ErrorKind::Busy));
        }
        if owner.priority() == Priority::Low && owner.signaled_count() > 0 {
            if registered {
                remove_requestor(frame, &mut ls, owner, is_hi);
            }
            return Err(Error::deadlock(Subsystem::Lock));
        }
        if !registered {
            registered = true;
            if is_hi {
                ls.requestors.push_front(Arc::clone(owner));
                ls.hipri_requestors += 1;
                if ls.hipri_owners == 0 {
                    signal_lopri_owners(&ls);
                }
            } else {
                ls.requestors.push_back(Arc::clone(owner));
            }
        }
        drop(ls);
        owner.sleep();
        ls = frame.lock_state.lock();
    }
}

fn wake_front(ls: &LockState) {
    if let Some(front) = ls.requestors.front() {
        front.wake();
    }
}

/// Release `mode` on `frame` for `owner`. Returns `true` when this was the
/// last lock on a frame marked dying (SPEC_FULL.md 4.2) — the caller (the
/// integration layer) must then finish evicting the frame from the cache.
pub fn release(frame: &Arc<Frame>, owner: &Arc<LockOwner>, mode: LockMode) -> bool {
    let mut ls = frame.lock_state.lock();
    match mode {
        LockMode::Write => {
            ls.reader_count += 1;
            if ls.reader_count == 0 {
                ls.write_owner = None;
            }
        }
        LockMode::Read => {
            ls.reader_count -= 1;
            if let Some(pos) = ls.read_owners.iter().position(|o| Arc::ptr_eq(o, owner)) {
                ls.read_owners.swap_remove(pos);
            }
        }
    }
    if owner.priority() == Priority::High {
        ls.hipri_owners = ls.hipri_owners.saturating_sub(1);
    }
    let now_free = ls.reader_count == 0;
    let dying = ls.dying;
    wake_front(&ls);
    drop(ls);
    owner.forget_held(frame);
    now_free && dying
}

/// Mark `frame` as dying and drain every queued requestor with `Invalid`.
/// `owner` must hold the write lock. Idempotent: a second call observes
/// `dying` already set and returns `Invalid` immediately without blocking.
pub fn invalidate(frame: &Arc<Frame>, owner: &Arc<LockOwner>) -> Result<()> {
    let mut ls = frame.lock_state.lock();
    if ls.dying {
        return Err(Error::invalid(Subsystem::Lock));
    }
    debug_assert!(ls.is_recursive_writer(owner), "invalidate requires the write lock");
    ls.dying = true;
    for req in ls.requestors.iter() {
        req.wake();
    }
    while !ls.requestors.is_empty() {
        frame.drain_cv.wait(&mut ls);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockid::BlockId;

    fn frame() -> Arc<Frame> {
        Frame::new(crate::frame::next_seq(), BlockId::new(0, 1))
    }

    #[test]
    fn read_locks_share() {
        let f = frame();
        let o1 = LockOwner::new(Priority::Low);
        let o2 = LockOwner::new(Priority::Low);
        acquire(&f, &o1, LockMode::Read, &NoCapture, false).unwrap();
        acquire(&f, &o2, LockMode::Read, &NoCapture, false).unwrap();
        assert_eq!(f.lock_state.lock().reader_count, 2);
    }

    #[test]
    fn write_lock_excludes_others() {
        let f = frame();
        let o1 = LockOwner::new(Priority::Low);
        let o2 = LockOwner::new(Priority::Low);
        acquire(&f, &o1, LockMode::Write, &NoCapture, false).unwrap();
        let err = acquire(&f, &o2, LockMode::Write, &NoCapture, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        release(&f, &o1, LockMode::Write);
        acquire(&f, &o2, LockMode::Write, &NoCapture, false).unwrap();
    }

    #[test]
    fn write_lock_is_recursive_for_same_owner() {
        let f = frame();
        let o1 = LockOwner::new(Priority::Low);
        acquire(&f, &o1, LockMode::Write, &NoCapture, false).unwrap();
        acquire(&f, &o1, LockMode::Write, &NoCapture, false).unwrap();
        assert_eq!(f.lock_state.lock().reader_count, -2);
    }

    #[test]
    fn invalidate_is_idempotent_and_drains() {
        let f = frame();
        let o1 = LockOwner::new(Priority::Low);
        acquire(&f, &o1, LockMode::Write, &NoCapture, false).unwrap();
        invalidate(&f, &o1).unwrap();
        let err = invalidate(&f, &o1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn dying_frame_rejects_new_locks() {
        let f = frame();
        let o1 = LockOwner::new(Priority::Low);
        let o2 = LockOwner::new(Priority::Low);
        acquire(&f, &o1, LockMode::Write, &NoCapture, false).unwrap();
        invalidate(&f, &o1).unwrap();
        let err = acquire(&f, &o2, LockMode::Read, &NoCapture, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }
}
