pub mod archive;
pub mod export;
pub mod metadata;
pub mod npy;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// `<base><suffix>.<ext>` next to the run's other files.
pub fn run_file(base: &Path, suffix: &str, ext: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}
