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

//! This module provides the error types used in the library, one per concern.
//! The error types use `thiserror`.

use std::io;
use thiserror::Error;

/// Errors returned by cache operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    /// The requested key is not present in the cache.
    #[error("not found")]
    NotFound,
}

/// Errors raised by a single upstream exchange. The dispatcher logs these and
/// moves on to the next server; they never reach the DNS client.
#[derive(Error, Debug)]
pub enum RouteError {
    /// Network failure while talking to the upstream.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The query failed to serialize or the reply failed to parse.
    #[error(transparent)]
    Proto(#[from] hickory_proto::error::ProtoError),

    /// The upstream did not answer within the exchange timeout.
    #[error("upstream {0} timed out")]
    Timeout(String),

    /// The configured server string resolved to no usable address.
    #[error("no address found for upstream {0}")]
    NoAddress(String),
}

/// Errors from persisting or restoring the cache snapshot.
#[derive(Error, Debug)]
pub enum PersistError {
    /// The snapshot file could not be read or written.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The snapshot could not be encoded or decoded.
    #[error(transparent)]
    Encoding(#[from] bincode::Error),

    /// A persisted resource record failed to round-trip through its wire form.
    #[error(transparent)]
    Proto(#[from] hickory_proto::error::ProtoError),
}
