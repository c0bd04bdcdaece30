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

//! `cowcore`: the core storage engine of a copy-on-write, transactional
//! filesystem — a buffered node cache, a long-term priority-aware lock
//! manager, a transaction (atom) manager, and a slum tracker for contiguous
//! dirty runs, wired together behind the [`engine::Engine`] facade.
//!
//! This crate is linked into a filesystem driver; it has no CLI and reads no
//! environment variables (see [`config::EngineConfig`]). Everything this
//! crate does not own — disk block I/O, the bitmap allocator, per-node-format
//! free-space accounting, journal durability, sibling/parent tree
//! navigation beyond bare connectivity — is expressed as a trait in
//! [`collab`] for a host to implement.

pub mod block;
pub mod blockid;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod lock;
pub mod slum;
pub mod tree;
pub mod txn;

pub use blockid::BlockId;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result, Subsystem};
pub use txn::{CaptureMode, Handle};
