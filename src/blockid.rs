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

use std::sync::atomic::{AtomicI64, Ordering};

/// Identifies a logical block on one superblock. Negative `number` means
/// "freshly allocated, not yet assigned a real on-disk location".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub super_id: u32,
    pub number: i64,
}

impl BlockId {
    pub fn new(super_id: u32, number: i64) -> Self {
        Self { super_id, number }
    }
    pub fn is_fresh(&self) -> bool {
        self.number < 0
    }
}

/// Per-superblock counter handing out descending negative block numbers for
/// [`BlockId::is_fresh`] placeholders (see `cache.create`).
#[derive(Debug)]
pub struct FreshIdGen {
    super_id: u32,
    next: AtomicI64,
}

impl FreshIdGen {
    pub fn new(super_id: u32) -> Self {
        Self { super_id, next: AtomicI64::new(-1) }
    }

    pub fn next(&self) -> BlockId {
        let number = self.next.fetch_sub(1, Ordering::Relaxed);
        BlockId::new(self.super_id, number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_negative_and_descending() {
        let gen = FreshIdGen::new(1);
        let a = gen.next();
        let b = gen.next();
        assert!(a.is_fresh());
        assert!(b.is_fresh());
        assert!(b.number < a.number);
    }
}
