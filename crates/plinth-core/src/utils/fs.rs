use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::TempDir;

/// Find files recursively in a directory that match a predicate
pub fn find_files<P, F>(path: P, predicate: &F) -> io::Result<Vec<PathBuf>>
where
    P: AsRef<Path>,
    F: Fn(&Path) -> bool + ?Sized,
{
    let mut result = Vec::new();

    if !path.as_ref().exists() {
        return Ok(result);
    }

    if path.as_ref().is_file() {
        if predicate(path.as_ref()) {
            result.push(path.as_ref().to_path_buf());
        }
        return Ok(result);
    }

    for entry_path in sorted_entries(path.as_ref())? {
        if entry_path.is_file() {
            if predicate(&entry_path) {
                result.push(entry_path);
            }
        } else if entry_path.is_dir() {
            let mut sub_results = find_files(&entry_path, predicate)?;
            result.append(&mut sub_results);
        }
    }

    Ok(result)
}

/// Find files whose extension matches one of `extensions` (case-insensitive)
pub fn find_files_with_extensions<P: AsRef<Path>>(
    path: P,
    extensions: &[String],
) -> io::Result<Vec<PathBuf>> {
    let wanted: Vec<String> = extensions.iter().map(|e| e.to_lowercase()).collect();
    find_files(path, &move |p: &Path| has_extension(p, &wanted))
}

/// Whether `path` carries one of the (lower-case) `extensions`
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(&ext))
        }
        None => false,
    }
}

/// Directory entries sorted by file name, so scans are deterministic.
pub fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        entries.push(entry?.path());
    }
    entries.sort();
    Ok(entries)
}

/// Temporary directory holding private copies of plugin artifacts.
///
/// Copies live as long as the area itself; dropping the last handle removes
/// the directory and everything staged into it.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
    staged: Mutex<usize>,
}

impl StagingArea {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("plinth-staging-").tempdir()?;
        Ok(Self { dir, staged: Mutex::new(0) })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Number of files copied in so far
    pub fn staged_count(&self) -> usize {
        *self.staged.lock()
    }

    /// Copy `source` into the staging directory and return the copy's path.
    ///
    /// Each copy gets its own numbered subdirectory so that equally named
    /// files from different directories never collide.
    pub fn stage(&self, source: &Path) -> io::Result<PathBuf> {
        let file_name = source.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot stage '{}': no file name", source.display()),
            )
        })?;
        let mut staged = self.staged.lock();
        let slot = self.dir.path().join(staged.to_string());
        fs::create_dir_all(&slot)?;
        let target = slot.join(file_name);
        fs::copy(source, &target)?;
        *staged += 1;
        Ok(target)
    }
}
