use std::fs::{self, File};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Suffix of in-flight temporary files. They only exist between create and
/// rename.
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

fn temp_path(path: &Utf8Path) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or("blob");
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp = format!(".{name}.{}-{n}{TEMP_SUFFIX}", std::process::id());

    match path.parent() {
        Some(dir) => dir.join(temp),
        None => Utf8PathBuf::from(temp),
    }
}

/// Replaces `path` with `bytes` so that readers observe either the old file,
/// no file, or the complete new file.
///
/// The data is written to a uniquely named sibling, flushed to disk and
/// renamed over the destination. Rename within one directory is atomic on
/// the platforms we target.
pub(crate) fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp = temp_path(path);

    let result = (|| {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }

    result
}
