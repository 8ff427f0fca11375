//! Whole-file snapshots: `magic | version | len: u64 | MessagePack body`.
//!
//! Used for the stream registry and the dump catalog. Saves go to a sibling
//! temporary file which is synced and renamed over the previous snapshot, so
//! readers after a crash see either the old or the new content.

use crate::error::{HarvestError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// Atomically replace the snapshot at `path`.
pub(crate) fn save<T: Serialize>(path: &Path, magic: &[u8; 4], version: u8, value: &T) -> Result<()> {
    let encoded = rmp_serde::to_vec(value)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path)?;

        file.write_all(magic)?;
        file.write_all(&[version])?;
        file.write_all(&(encoded.len() as u64).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Load a snapshot, or `None` if it was never written.
pub(crate) fn load<T: DeserializeOwned>(path: &Path, magic: &[u8; 4], version: u8) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path)?;

    let mut found = [0u8; 4];
    file.read_exact(&mut found)?;
    if &found != magic {
        return Err(HarvestError::InvalidFormat(format!(
            "Invalid magic in {}",
            path.display()
        )));
    }

    let mut found_version = [0u8; 1];
    file.read_exact(&mut found_version)?;
    if found_version[0] != version {
        return Err(HarvestError::InvalidFormat(format!(
            "Unsupported version {} in {}",
            found_version[0],
            path.display()
        )));
    }

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;

    let mut encoded = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut encoded)?;
    if encoded.len() != len {
        return Err(HarvestError::Corruption(format!(
            "{} is truncated",
            path.display()
        )));
    }

    Ok(Some(rmp_serde::from_slice(&encoded)?))
}
