//! Deterministic recursive file lookup inside resolved snapshots.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// First regular file under `dir` whose name ends with `suffix`.
///
/// Entries are visited depth-first in file-name order, so the answer does not
/// depend on the filesystem's directory ordering. A missing or unreadable
/// directory yields `None`, as does a tree without a match.
pub fn find_first(dir: impl AsRef<Path>, suffix: &str) -> Option<PathBuf> {
    matching_files(dir.as_ref(), suffix).next()
}

/// Every matching file, in the same order [`find_first`] walks them.
pub fn find_all(dir: impl AsRef<Path>, suffix: &str) -> Vec<PathBuf> {
    matching_files(dir.as_ref(), suffix).collect()
}

/// Lazy walk; directories are only read once the iterator reaches them.
fn matching_files<'a>(dir: &Path, suffix: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(move |entry| entry.file_name().to_string_lossy().ends_with(suffix))
        .map(|entry| entry.into_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_no_match_returns_none() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{}").unwrap();
        assert_eq!(find_first(dir.path(), ".wav"), None);
    }

    #[test]
    fn test_missing_dir_returns_none() {
        assert_eq!(find_first("/definitely/not/here", ".pth"), None);
    }

    #[test]
    fn test_first_match_is_deterministic() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("b").join("one.wav"), b"").unwrap();
        fs::write(dir.path().join("a").join("zed.wav"), b"").unwrap();
        fs::write(dir.path().join("a").join("alpha.wav"), b"").unwrap();

        for _ in 0..3 {
            assert_eq!(
                find_first(dir.path(), ".wav"),
                Some(dir.path().join("a").join("alpha.wav"))
            );
        }
        assert_eq!(find_all(dir.path(), ".wav").len(), 3);
    }

    #[test]
    fn test_walk_stops_at_first_match() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("a").join("alpha.pth"), b"").unwrap();
        fs::write(dir.path().join("b").join("beta.pth"), b"").unwrap();

        let mut walk = matching_files(dir.path(), ".pth");
        assert_eq!(walk.next(), Some(dir.path().join("a").join("alpha.pth")));

        // `b` has not been read yet, so removing it now hides its file
        fs::remove_dir_all(dir.path().join("b")).unwrap();
        assert_eq!(walk.count(), 0);
    }

    #[test]
    fn test_directories_are_skipped() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("fake.pth")).unwrap();
        fs::write(dir.path().join("fake.pth").join("model.pth"), b"").unwrap();
        assert_eq!(
            find_first(dir.path(), ".pth"),
            Some(dir.path().join("fake.pth").join("model.pth"))
        );
    }
}
