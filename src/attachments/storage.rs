//! Attachment storage implementation.

use crate::error::{HarvestError, Result};
use crate::types::Hash;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Magic bytes for attachment files.
const ATTACHMENT_MAGIC: &[u8; 4] = b"ATT\0";

/// Current attachment format version.
const ATTACHMENT_VERSION: u8 = 1;

/// Suffix of files still being written.
const PARTIAL_SUFFIX: &str = ".partial";

/// Distinguishes the partial files of concurrent writers of the same content.
static PARTIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stored bytes plus their media type.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub hash: Hash,
    pub content: Arc<Vec<u8>>,
    pub content_type: String,
}

#[derive(Clone)]
struct CachedAttachment {
    content: Arc<Vec<u8>>,
    content_type: String,
}

/// Content-addressed attachment store.
pub struct AttachmentStore {
    /// Base directory.
    path: PathBuf,

    /// LRU cache of recently read attachments; pages are re-read by every
    /// harvester walking the same listing.
    cache: Mutex<LruCache<Hash, CachedAttachment>>,
}

impl AttachmentStore {
    /// Open (creating if needed) an attachment store at the given path.
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Store bytes, returning their hash.
    ///
    /// Storing content that already exists is a no-op. The file only appears
    /// under its final name once fully written and synced; each writer uses
    /// its own partial file, so concurrent puts of the same bytes both
    /// succeed.
    pub fn put(&self, content: &[u8], content_type: &str) -> Result<Hash> {
        let hash = Hash::from_bytes(content);

        if self.exists(&hash) {
            return Ok(hash);
        }

        let shard_dir = self.shard_path(&hash);
        fs::create_dir_all(&shard_dir)?;

        let final_path = self.attachment_path(&hash);
        let partial_path = shard_dir.join(format!(
            "{}.{}.{}{}",
            hash.to_hex(),
            std::process::id(),
            PARTIAL_COUNTER.fetch_add(1, Ordering::Relaxed),
            PARTIAL_SUFFIX
        ));

        {
            let mut file = File::create(&partial_path)?;

            file.write_all(ATTACHMENT_MAGIC)?;
            file.write_all(&[ATTACHMENT_VERSION])?;

            let content_type_bytes = content_type.as_bytes();
            file.write_all(&(content_type_bytes.len() as u16).to_le_bytes())?;
            file.write_all(content_type_bytes)?;

            file.write_all(&(content.len() as u64).to_le_bytes())?;
            file.write_all(content)?;

            let checksum = crc32fast::hash(content);
            file.write_all(&checksum.to_le_bytes())?;

            file.sync_all()?;
        }

        if let Err(e) = fs::rename(&partial_path, &final_path) {
            // A concurrent writer may have published the same content.
            fs::remove_file(&partial_path)?;
            if !final_path.exists() {
                return Err(e.into());
            }
        }

        self.cache.lock().put(
            hash,
            CachedAttachment {
                content: Arc::new(content.to_vec()),
                content_type: content_type.to_string(),
            },
        );

        Ok(hash)
    }

    /// Get an attachment by hash.
    pub fn get(&self, hash: &Hash) -> Result<Option<Attachment>> {
        if let Some(cached) = self.cache.lock().get(hash).cloned() {
            return Ok(Some(Attachment {
                hash: *hash,
                content: cached.content,
                content_type: cached.content_type,
            }));
        }

        let path = self.attachment_path(hash);
        if !path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ATTACHMENT_MAGIC {
            return Err(HarvestError::InvalidFormat("Invalid attachment magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != ATTACHMENT_VERSION {
            return Err(HarvestError::InvalidFormat(format!(
                "Unsupported attachment version: {}",
                version[0]
            )));
        }

        let mut content_type_len_bytes = [0u8; 2];
        file.read_exact(&mut content_type_len_bytes)?;
        let content_type_len = u16::from_le_bytes(content_type_len_bytes) as usize;
        let mut content_type_bytes = vec![0u8; content_type_len];
        file.read_exact(&mut content_type_bytes)?;
        let content_type = String::from_utf8_lossy(&content_type_bytes).into_owned();

        let mut content_len_bytes = [0u8; 8];
        file.read_exact(&mut content_len_bytes)?;
        let content_len = u64::from_le_bytes(content_len_bytes) as usize;
        let mut content = vec![0u8; content_len];
        file.read_exact(&mut content)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&content);
        if stored_checksum != computed_checksum {
            return Err(HarvestError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let computed_hash = Hash::from_bytes(&content);
        if &computed_hash != hash {
            return Err(HarvestError::HashMismatch {
                expected: *hash,
                got: computed_hash,
            });
        }

        let content = Arc::new(content);
        self.cache.lock().put(
            *hash,
            CachedAttachment {
                content: Arc::clone(&content),
                content_type: content_type.clone(),
            },
        );

        Ok(Some(Attachment {
            hash: *hash,
            content,
            content_type,
        }))
    }

    /// Get an attachment that must exist.
    pub fn read(&self, hash: &Hash) -> Result<Attachment> {
        self.get(hash)?
            .ok_or(HarvestError::AttachmentNotFound(*hash))
    }

    /// Check if an attachment exists.
    pub fn exists(&self, hash: &Hash) -> bool {
        if self.cache.lock().contains(hash) {
            return true;
        }
        self.attachment_path(hash).exists()
    }

    /// Delete an attachment.
    pub fn delete(&self, hash: &Hash) -> Result<bool> {
        self.cache.lock().pop(hash);

        let path = self.attachment_path(hash);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// List all attachment hashes.
    pub fn list(&self) -> Result<Vec<Hash>> {
        let mut hashes = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for file_entry in fs::read_dir(entry.path())? {
                    let file_entry = file_entry?;
                    let filename = file_entry.file_name();
                    if let Ok(hash) = Hash::from_hex(&filename.to_string_lossy()) {
                        hashes.push(hash);
                    }
                }
            }
        }

        Ok(hashes)
    }

    /// Delete every attachment not in `keep`, plus leftover partial files.
    ///
    /// Returns the number of files removed.
    pub fn sweep(&self, keep: &HashSet<Hash>) -> Result<usize> {
        let mut removed = 0;

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for file_entry in fs::read_dir(entry.path())? {
                let file_entry = file_entry?;
                let filename = file_entry.file_name();
                let filename = filename.to_string_lossy();

                if filename.ends_with(PARTIAL_SUFFIX) {
                    fs::remove_file(file_entry.path())?;
                    removed += 1;
                    continue;
                }

                if let Ok(hash) = Hash::from_hex(&filename) {
                    if !keep.contains(&hash) {
                        self.cache.lock().pop(&hash);
                        fs::remove_file(file_entry.path())?;
                        removed += 1;
                    }
                }
            }
        }

        Ok(removed)
    }

    fn shard_path(&self, hash: &Hash) -> PathBuf {
        self.path.join(hash.shard_prefix())
    }

    fn attachment_path(&self, hash: &Hash) -> PathBuf {
        self.shard_path(hash).join(hash.to_hex())
    }
}
