use super::IoManager;
use crate::errors::Result;

use memmap2::Mmap;
use std::fs::OpenOptions;
use std::path::Path;

/// Read-only memory-mapped backend, used to speed up the startup scan. The
/// engine rebinds every data file to [`super::FileIo`] before accepting
/// writes; calling `write` or `sync` here is a programmer error.
pub struct MmapIo {
    /// `None` for an empty file, which cannot be mapped.
    map: Option<Mmap>,
}

impl MmapIo {
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).create(true).append(true).open(path)?;
        let map = match file.metadata()?.len() {
            0 => None,
            _ => Some(unsafe { Mmap::map(&file)? }),
        };
        Ok(Self { map })
    }

    fn len(&self) -> u64 {
        self.map.as_ref().map_or(0, |m| m.len() as u64)
    }
}

impl IoManager for MmapIo {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let len = self.len();
        if offset >= len {
            return Ok(0);
        }
        let map = self.map.as_ref().expect("non-empty map");
        let end = len.min(offset + buf.len() as u64);
        let n = (end - offset) as usize;
        buf[..n].copy_from_slice(&map[offset as usize..end as usize]);
        Ok(n)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        panic!("write on a memory-mapped data file");
    }

    fn sync(&self) -> Result<()> {
        panic!("sync on a memory-mapped data file");
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fio::FileIo;

    #[test]
    fn reads_what_file_io_wrote() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-fio")?;
        let path = dir.path().join("a.data");
        let io = FileIo::new(&path)?;
        io.write(b"mapped contents")?;
        io.sync()?;

        let mmap = MmapIo::new(&path)?;
        assert_eq!(mmap.size()?, 15);

        let mut buf = [0u8; 6];
        assert_eq!(mmap.read_at(&mut buf, 0)?, 6);
        assert_eq!(&buf, b"mapped");
        assert_eq!(mmap.read_at(&mut buf, 7)?, 6);
        assert_eq!(&buf, b"conten");
        Ok(())
    }

    #[test]
    fn empty_file_maps_to_empty_buffer() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-fio")?;
        let mmap = MmapIo::new(&dir.path().join("empty.data"))?;
        assert_eq!(mmap.size()?, 0);

        let mut buf = [0u8; 4];
        assert_eq!(mmap.read_at(&mut buf, 0)?, 0);
        Ok(())
    }

    #[test]
    fn short_read_at_tail() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("embercask-fio")?;
        let path = dir.path().join("a.data");
        FileIo::new(&path)?.write(b"abcdef")?;

        let mmap = MmapIo::new(&path)?;
        let mut buf = [0u8; 4];
        assert_eq!(mmap.read_at(&mut buf, 4)?, 2);
        assert_eq!(&buf[..2], b"ef");
        Ok(())
    }

    #[test]
    #[should_panic(expected = "memory-mapped")]
    fn write_panics() {
        let dir = tempfile::TempDir::with_prefix("embercask-fio").unwrap();
        let mmap = MmapIo::new(&dir.path().join("a.data")).unwrap();
        let _ = mmap.write(b"nope");
    }
}
