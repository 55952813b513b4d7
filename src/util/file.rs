use crate::errors::Result;

use std::fs;
use std::path::Path;

/// Returns the total size in bytes of all files under `dir`, recursively.
pub(crate) fn dir_size(dir: &Path) -> Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            size += dir_size(&entry.path())?;
        } else {
            size += metadata.len();
        }
    }
    Ok(size)
}

/// Returns the free space on the filesystem holding `dir`.
pub(crate) fn available_disk_size(dir: &Path) -> Result<u64> {
    Ok(fs4::available_space(dir)?)
}

/// Recursively copies `src` into `dst`, skipping entries whose file name is in
/// `exclude`. `dst` is created if absent.
pub(crate) fn copy_dir(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    if !dst.is_dir() {
        fs::create_dir_all(dst)?;
    }
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if exclude.contains(&name) {
                continue;
            }
        }
        let target = dst.join(&name);
        if entry.metadata()?.is_dir() {
            copy_dir(&entry.path(), &target, exclude)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
