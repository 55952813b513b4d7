use super::IoManager;
use crate::errors::Result;

use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Standard file IO backend. The file is opened read+create+append, so every
/// `write` lands at the end regardless of concurrent positional reads.
pub struct FileIo {
    fd: Arc<RwLock<File>>,
}

impl FileIo {
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).create(true).append(true).open(path)?;
        Ok(Self { fd: Arc::new(RwLock::new(file)) })
    }
}

impl IoManager for FileIo {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let fd = self.fd.read();
        let mut read = 0;
        while read < buf.len() {
            let n = fd.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut fd = self.fd.write();
        fd.write_all(buf)?;
        Ok(buf.len())
    }

    fn sync(&self) -> Result<()> {
        Ok(self.fd.read().sync_all()?)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.fd.read().metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_appends_and_size_tracks() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-fio")?;
        let io = FileIo::new(&dir.path().join("a.data"))?;

        assert_eq!(io.write(b"hello")?, 5);
        assert_eq!(io.write(b" world")?, 6);
        assert_eq!(io.size()?, 11);
        Ok(())
    }

    #[test]
    fn read_at_is_positional() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-fio")?;
        let io = FileIo::new(&dir.path().join("a.data"))?;
        io.write(b"key-a|key-b")?;

        let mut buf = [0u8; 5];
        assert_eq!(io.read_at(&mut buf, 6)?, 5);
        assert_eq!(&buf, b"key-b");
        assert_eq!(io.read_at(&mut buf, 0)?, 5);
        assert_eq!(&buf, b"key-a");
        Ok(())
    }

    #[test]
    fn read_past_end_is_short() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-fio")?;
        let io = FileIo::new(&dir.path().join("a.data"))?;
        io.write(b"abc")?;

        let mut buf = [0u8; 8];
        assert_eq!(io.read_at(&mut buf, 1)?, 2);
        assert_eq!(io.read_at(&mut buf, 3)?, 0);
        assert_eq!(io.read_at(&mut buf, 100)?, 0);
        Ok(())
    }

    #[test]
    fn sync_and_close() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-fio")?;
        let io = FileIo::new(&dir.path().join("a.data"))?;
        io.write(b"abc")?;
        io.sync()?;
        io.close()?;
        Ok(())
    }
}
