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

//! Cache snapshot persistence.
//!
//! The snapshot map is encoded with `bincode`. Each resource record is stored
//! in its canonical DNS wire form, which carries its own type and class and
//! therefore round-trips every record variant the codec understands.

use crate::{
    cache::{CacheEntry, Snapshot},
    error::PersistError,
};
use hashbrown::HashMap;
use hickory_proto::{
    rr::Record,
    serialize::binary::{BinDecodable, BinEncodable},
};
use log::*;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind},
    path::Path,
    time::SystemTime,
};

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    records: Vec<Vec<u8>>,
    expires_at: SystemTime,
}

/// Write `snapshot` to `path`, expired entries included.
///
/// The snapshot is written to a sibling temp file and renamed into place, so an
/// interrupted persist never leaves a torn file behind.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), PersistError> {
    let mut encoded: HashMap<&str, PersistedEntry> = HashMap::with_capacity(snapshot.len());
    for (name, entry) in snapshot {
        let mut records = Vec::with_capacity(entry.records.len());
        for record in &entry.records {
            records.push(record.to_bytes()?);
        }
        encoded.insert(
            name.as_str(),
            PersistedEntry {
                records,
                expires_at: entry.expires_at,
            },
        );
    }

    let tmp = path.with_extension("tmp");
    bincode::serialize_into(BufWriter::new(File::create(&tmp)?), &encoded)?;
    fs::rename(&tmp, path)?;
    debug!("wrote {} cache entries to {}", encoded.len(), path.display());
    Ok(())
}

/// Read a snapshot back from `path`.
///
/// A missing file is a normal empty start and yields `Ok(None)`. Entries that
/// expired since they were written are loaded as-is; the cache reports them as
/// expired.
pub fn load(path: &Path) -> Result<Option<Snapshot>, PersistError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("cache file {} does not exist", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let encoded: HashMap<String, PersistedEntry> = bincode::deserialize_from(BufReader::new(file))?;

    let mut snapshot = Snapshot::with_capacity(encoded.len());
    for (name, entry) in encoded {
        let mut records = Vec::with_capacity(entry.records.len());
        for bytes in &entry.records {
            records.push(Record::from_bytes(bytes)?);
        }
        snapshot.insert(
            name,
            CacheEntry {
                records,
                expires_at: entry.expires_at,
            },
        );
    }
    Ok(Some(snapshot))
}
