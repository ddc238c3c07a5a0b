use std::fs;
use std::io::{self, Write};
use std::path::Path;

use chrono::Utc;
use serde::Serialize;

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Write through a sibling temp file and rename, so readers never observe a
/// partially written document.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    atomic_write_bytes(path, &bytes)
}

/// Number of direct entries in `dir`; a missing directory has none.
pub fn count_entries(dir: &Path) -> io::Result<usize> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut count = 0;
            for entry in entries {
                entry?;
                count += 1;
            }
            Ok(count)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Recursively copy `src` into `dst`, following symlinks.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    ensure_dir(dst)?;
    for entry in walkdir::WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, &target)?;
        }
    }
    Ok(())
}
