//! Filesystem helpers: collision-free output names, input expansion and
//! best-effort cleanup of intermediate files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Returns `original` if it is free, otherwise the first free variant with
/// `" copy"`, `" copy 2"`, … inserted before the extension, Finder style:
/// `photo.png` → `photo copy.png` → `photo copy 2.png`.
///
/// `taken` decides whether a candidate is occupied (on disk, reserved, ...).
pub fn unique_path<F>(original: &Path, taken: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    if !taken(original) {
        return original.to_path_buf();
    }

    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = original.extension().map(|e| e.to_string_lossy().into_owned());

    let mut idx: u64 = 1;
    loop {
        let copy = if idx == 1 {
            format!("{stem} copy")
        } else {
            format!("{stem} copy {idx}")
        };
        let candidate = match &ext {
            Some(ext) => original.with_file_name(format!("{copy}.{ext}")),
            None => original.with_file_name(copy),
        };
        if !taken(&candidate) {
            return candidate;
        }
        idx += 1;
    }
}

/// Expands directories to the regular files below them (sorted, links not
/// followed). Plain paths are passed through untouched, even when missing, so
/// that a bad path fails as its own job.
pub fn expand_inputs(inputs: &[PathBuf]) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if !input.is_dir() {
            files.push(input.clone());
            continue;
        }
        let mut found = Vec::new();
        for entry in WalkDir::new(input).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_file() {
                found.push(entry.into_path());
            }
        }
        found.sort();
        debug!(dir = %input.display(), files = found.len(), "expanded input directory");
        files.extend(found);
    }
    Ok(files)
}

/// Deletes a file, logging instead of failing. A missing file is not an error.
pub fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed intermediate"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "can't remove intermediate"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[test]
    fn free_name_is_kept() {
        let path = Path::new("/x/photo.png");
        assert_eq!(unique_path(path, |_| false), path);
    }

    #[test]
    fn copies_insert_before_extension() {
        let mut taken: HashSet<PathBuf> = HashSet::new();
        taken.insert(PathBuf::from("/x/photo.png"));
        let first = unique_path(Path::new("/x/photo.png"), |p| taken.contains(p));
        assert_eq!(first, PathBuf::from("/x/photo copy.png"));

        taken.insert(first);
        let second = unique_path(Path::new("/x/photo.png"), |p| taken.contains(p));
        assert_eq!(second, PathBuf::from("/x/photo copy 2.png"));
    }

    #[test]
    fn extensionless_names_get_plain_suffix() {
        let taken = [PathBuf::from("/x/README")];
        let next = unique_path(Path::new("/x/README"), |p| taken.iter().any(|t| t == p));
        assert_eq!(next, PathBuf::from("/x/README copy"));
    }

    #[test]
    fn existing_files_count_as_taken() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt.enc");
        fs::write(&path, b"x").unwrap();
        let next = unique_path(&path, |p| p.exists());
        assert_eq!(next, dir.path().join("a.txt copy.enc"));
    }

    #[test]
    fn directories_expand_to_sorted_files() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("sub").join("a.txt"), b"a").unwrap();
        let single = dir.path().join("single");
        let missing = dir.path().join("missing");
        fs::write(&single, b"s").unwrap();

        let files = expand_inputs(&[dir.path().join("sub"), single.clone(), missing.clone()]).unwrap();
        assert_eq!(files, vec![dir.path().join("sub").join("a.txt"), single, missing]);
    }

    #[test]
    fn remove_quietly_ignores_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone");
        remove_quietly(&path);
        fs::write(&path, b"x").unwrap();
        remove_quietly(&path);
        assert!(!path.exists());
    }
}
