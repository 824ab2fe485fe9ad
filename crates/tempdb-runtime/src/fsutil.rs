// SPDX-License-Identifier: Apache-2.0

//! Filesystem helpers that tolerate brief locking on busy machines.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use walkdir::WalkDir;

const RETRIES: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Runs `op` until it succeeds or the retry budget is spent.
pub fn retry<T, F>(mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= RETRIES => return Err(e),
            Err(_) => {
                attempt += 1;
                thread::sleep(RETRY_DELAY);
            }
        }
    }
}

/// Recursively copies `src` into `dst`, creating `dst` as needed.
pub fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            retry(|| fs::copy(entry.path(), &target))?;
        }
    }
    Ok(())
}

/// Removes a directory tree; a missing directory is not an error.
pub fn remove_dir_all(path: &Path) -> io::Result<()> {
    retry(|| match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
}

/// Removes a file; a missing file is not an error.
pub fn remove_file(path: &Path) -> io::Result<()> {
    retry(|| match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
}
