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

//! Construction-time configuration for [`crate::engine::Engine`].
//!
//! There is no CLI and no environment variable reader in this crate; a host
//! process owns those concerns and builds an [`EngineConfig`] explicitly.

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of frame slots the cache may hold resident at once.
    pub page_count: usize,
    /// Target average bucket occupancy for the block hash; bucket count is
    /// derived as `page_count / fill_factor` rounded up to the next odd size.
    pub fill_factor: usize,
    /// Requestors to satisfy per replacement pass before yielding the replacer lock.
    pub replacement_chunk: usize,
    /// High-priority requestors a frame may accumulate before its low-priority
    /// owners are signaled, even without a deadlock condition (tuning knob;
    /// the deadlock condition itself is unconditional, see [`crate::lock`]).
    pub hipri_yield_threshold: usize,
}

impl EngineConfig {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            fill_factor: Self::DEFAULT_FILL_FACTOR,
            replacement_chunk: Self::DEFAULT_REPLACEMENT_CHUNK,
            hipri_yield_threshold: Self::DEFAULT_HIPRI_YIELD_THRESHOLD,
        }
    }
    const DEFAULT_FILL_FACTOR: usize = 1;
    const DEFAULT_REPLACEMENT_CHUNK: usize = 16;
    const DEFAULT_HIPRI_YIELD_THRESHOLD: usize = 1;

    pub(crate) fn bucket_count(&self) -> usize {
        let raw = (self.page_count / self.fill_factor.max(1)).max(1);
        raw | 1
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_count_is_odd_and_nonzero() {
        let cfg = EngineConfig::new(100);
        assert_eq!(cfg.bucket_count() % 2, 1);
        assert!(cfg.bucket_count() > 0);
    }
}
