//! Append-only upload log.

use crate::error::{HarvestError, Result};
use crate::types::Upload;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the upload log.
const LOG_MAGIC: &[u8; 4] = b"UPL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Header size (magic + version).
const LOG_HEADER_SIZE: u64 = 5;

/// Upper bound for a single framed upload.
const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

/// Append-only log of upload batches.
///
/// Each upload is one frame: `len: u32 | MessagePack body | crc32: u32`.
pub struct UploadLog {
    path: PathBuf,

    /// Log file handle, positioned for appending.
    file: Mutex<File>,
}

impl UploadLog {
    /// Open or create an upload log, returning it with every stored upload
    /// in append order.
    ///
    /// A checksum mismatch or a truncated frame is reported as corruption:
    /// without the full log the live record set cannot be established.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<Upload>)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let uploads = if file.metadata()?.len() == 0 {
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
            Vec::new()
        } else {
            Self::replay(&file)?
        };

        file.seek(SeekFrom::End(0))?;

        Ok((
            Self {
                path,
                file: Mutex::new(file),
            },
            uploads,
        ))
    }

    /// Append an upload and sync it to disk.
    pub fn append(&self, upload: &Upload) -> Result<()> {
        let encoded = rmp_serde::to_vec(upload)?;
        if encoded.len() > MAX_FRAME_LEN {
            return Err(HarvestError::InvalidOperation(format!(
                "upload of {} bytes exceeds the {} byte frame limit",
                encoded.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut file = self.file.lock();
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        file.sync_data()?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log file in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn replay(file: &File) -> Result<Vec<Upload>> {
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(HarvestError::InvalidFormat("Invalid upload log magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(HarvestError::InvalidFormat(format!(
                "Unsupported upload log version: {}",
                version[0]
            )));
        }

        let mut uploads = Vec::new();
        let mut offset = LOG_HEADER_SIZE;

        loop {
            let mut len_bytes = [0u8; 4];
            match read_frame_start(&mut reader, &mut len_bytes)? {
                FrameStart::Eof => break,
                FrameStart::Partial => {
                    return Err(HarvestError::Corruption(format!(
                        "truncated upload frame header at offset {offset}"
                    )))
                }
                FrameStart::Complete => {}
            }

            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_FRAME_LEN {
                return Err(HarvestError::Corruption(format!(
                    "upload frame at offset {offset} claims {len} bytes"
                )));
            }

            let mut encoded = vec![0u8; len];
            let mut checksum_bytes = [0u8; 4];
            reader
                .read_exact(&mut encoded)
                .and_then(|_| reader.read_exact(&mut checksum_bytes))
                .map_err(|e| match e.kind() {
                    ErrorKind::UnexpectedEof => HarvestError::Corruption(format!(
                        "truncated upload frame at offset {offset}"
                    )),
                    _ => HarvestError::Io(e),
                })?;

            let stored = u32::from_le_bytes(checksum_bytes);
            let computed = crc32fast::hash(&encoded);
            if stored != computed {
                return Err(HarvestError::Corruption(format!(
                    "upload log checksum mismatch at offset {offset}"
                )));
            }

            uploads.push(rmp_serde::from_slice(&encoded)?);
            offset += 4 + len as u64 + 4;
        }

        Ok(uploads)
    }
}

enum FrameStart {
    Eof,
    Partial,
    Complete,
}

/// Fill `buf`, telling a clean end of log apart from a torn frame header.
fn read_frame_start(reader: &mut impl Read, buf: &mut [u8; 4]) -> Result<FrameStart> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    FrameStart::Eof
                } else {
                    FrameStart::Partial
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(FrameStart::Complete)
}
