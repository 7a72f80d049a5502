use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fs4::FileExt;

use crate::error::CResult;
use crate::storage::KeyDir;

/// An append-only log file containing a sequence of key/value entries:
///
/// - Key length as big-endian u32.
/// - Value length as big-endian i32, or -1 for tombstones.
/// - Key as raw bytes.
/// - Value as raw bytes.
pub struct Log {
    /// Path to the log file.
    pub(crate) path: PathBuf,
    /// The opened file containing the log.
    pub(crate) file: std::fs::File,
}

impl Log {
    /// Opens a log file, or creates one if it does not exist. Takes out an
    /// exclusive lock on the file until it is closed, or errors if the lock
    /// is already held.
    pub fn new(path: PathBuf) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file =
            std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.try_lock_exclusive()?;
        Ok(Self { path, file })
    }

    /// Scans the log to rebuild the in-memory keydir when the engine opens.
    /// An incomplete entry at the end of the file is assumed to be a torn
    /// write and truncated away.
    pub fn build_keydir(&mut self) -> CResult<KeyDir> {
        let mut keydir = KeyDir::new();
        let file_len = self.file.metadata()?.len();
        let mut reader = BufReader::new(&mut self.file);
        let mut pos = reader.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            // Read the next entry, returning the key, value position, and
            // value length or None for tombstones.
            let mut result = || -> Result<(Vec<u8>, u64, Option<u32>), std::io::Error> {
                let key_len = reader.read_u32::<BigEndian>()?;
                let value_len_or_tombstone = match reader.read_i32::<BigEndian>()? {
                    l if l >= 0 => Some(l as u32),
                    _ => None, // -1 for tombstones
                };
                let value_pos = pos + 4 + 4 + key_len as u64;

                let mut key = vec![0; key_len as usize];
                reader.read_exact(&mut key)?;

                if let Some(value_len) = value_len_or_tombstone {
                    if value_pos + value_len as u64 > file_len {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "value extends beyond end of file",
                        ));
                    }
                    reader.seek_relative(value_len as i64)?; // avoids discarding the buffer
                }

                Ok((key, value_pos, value_len_or_tombstone))
            };

            match result() {
                // Populate the keydir with the entry, or remove it on
                // tombstones.
                Ok((key, value_pos, Some(value_len))) => {
                    keydir.insert(key, (value_pos, value_len));
                    pos = value_pos + value_len as u64;
                }
                Ok((key, value_pos, None)) => {
                    keydir.remove(&key);
                    pos = value_pos;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!("found incomplete entry at offset {}, truncating file", pos);
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(keydir)
    }

    /// Reads a value given its position and length.
    pub fn read_value(&mut self, value_pos: u64, value_len: u32) -> CResult<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.seek(SeekFrom::Start(value_pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Appends a key/value entry to the log file, using a None value for
    /// tombstones. Returns the position and length of the entry.
    pub fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
        let key_len = key.len() as u32;
        let value_len = value.map_or(0, |v| v.len() as u32);
        let value_len_or_tombstone = value.map_or(-1, |v| v.len() as i32);
        let len = 4 + 4 + key_len + value_len;

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut writer = BufWriter::with_capacity(len as usize, &mut self.file);
        writer.write_u32::<BigEndian>(key_len)?;
        writer.write_i32::<BigEndian>(value_len_or_tombstone)?;
        writer.write_all(key)?;
        if let Some(value) = value {
            writer.write_all(value)?;
        }
        writer.flush()?;

        Ok((pos, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_builds_empty_keydir() -> CResult<()> {
        let path = tempdir::TempDir::new("log")?.path().join("kv");
        let mut log = Log::new(path)?;
        assert!(log.build_keydir()?.is_empty());
        Ok(())
    }

    #[test]
    fn keydir_reflects_writes_and_tombstones() -> CResult<()> {
        let dir = tempdir::TempDir::new("log")?;
        let path = dir.path().join("kv");
        {
            let mut log = Log::new(path.clone())?;
            log.write_entry(b"a", Some(b"1"))?;
            log.write_entry(b"b", Some(b"2"))?;
            log.write_entry(b"a", None)?;
        }
        let mut log = Log::new(path)?;
        let keydir = log.build_keydir()?;
        assert_eq!(keydir.len(), 1);
        let (pos, len) = keydir[b"b".as_slice()];
        assert_eq!(log.read_value(pos, len)?, b"2".to_vec());
        Ok(())
    }
}
