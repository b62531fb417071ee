// Copyright 2024 Yann Prado
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

#![deny(missing_docs)]
#![deny(unsafe_code)]
// Documentation
//! This is the core library for dfwd. It implements the response cache with its
//! on-disk snapshot format, the regex match table routing query names to upstream
//! groups, and the per-query dispatcher that traverses upstreams in order.

pub mod cache;
pub mod error;
#[doc(hidden)]
pub mod mock;
pub mod persist;
pub mod router;
pub mod table;
pub mod upstream;

pub use self::{
    cache::{CacheEntry, MemoryCache},
    router::Router,
    table::{MatchTable, TableHandle},
    upstream::{DefaultsHandle, Upstream},
};
