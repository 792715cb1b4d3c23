//! Discovery of capture sessions under a batch root.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::PipelineError;

/// One capture folder under the batch root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Directory name, unique within the root.
    pub name: String,
    /// Absolute or root-relative path to the session directory.
    pub path: PathBuf,
}

impl Session {
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self { name, path }
    }

    /// Path of a file directly inside the session directory.
    #[inline]
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

/// Lazy, single-pass sequence of sessions found under a root.
///
/// Directory entries are read and ordered once when the iterator is created;
/// each call to `next` hands out the following subdirectory by name. The
/// iterator cannot be restarted.
pub struct SessionIter {
    dirs: std::vec::IntoIter<PathBuf>,
}

impl Iterator for SessionIter {
    type Item = Session;

    fn next(&mut self) -> Option<Self::Item> {
        self.dirs.next().map(Session::new)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.dirs.size_hint()
    }
}

impl ExactSizeIterator for SessionIter {}

/// Enumerate the immediate subdirectories of `root` as sessions.
///
/// Non-directory entries, unreadable entries and hidden directories are
/// skipped. Sessions come out in lexicographic order of their names.
///
/// # Errors
///
/// Returns [`PipelineError::RootNotFound`] if `root` does not exist or is
/// not a directory.
pub fn locate_sessions(root: &Path) -> Result<SessionIter, PipelineError> {
    if !root.is_dir() {
        return Err(PipelineError::RootNotFound(root.to_path_buf()));
    }

    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .map(|n| !n.to_string_lossy().starts_with('.'))
                    .unwrap_or(false)
        })
        .collect();

    dirs.sort();

    Ok(SessionIter {
        dirs: dirs.into_iter(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_locate_sessions_sorted_dirs_only() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("b_run")).unwrap();
        fs::create_dir(temp_dir.path().join("a_run")).unwrap();
        File::create(temp_dir.path().join("notes.txt")).unwrap();

        let names: Vec<String> = locate_sessions(temp_dir.path())
            .unwrap()
            .map(|s| s.name)
            .collect();

        assert_eq!(names, vec!["a_run", "b_run"]);
    }

    #[test]
    fn test_locate_sessions_not_recursive() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("outer/inner")).unwrap();

        let sessions: Vec<Session> = locate_sessions(temp_dir.path()).unwrap().collect();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "outer");
    }

    #[test]
    fn test_locate_sessions_skips_hidden() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join(".cache")).unwrap();
        fs::create_dir(temp_dir.path().join("A")).unwrap();

        let iter = locate_sessions(temp_dir.path()).unwrap();
        assert_eq!(iter.len(), 1);
    }

    #[test]
    fn test_locate_sessions_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");

        let err = locate_sessions(&missing).err().unwrap();
        assert!(matches!(err, PipelineError::RootNotFound(p) if p == missing));
    }

    #[test]
    fn test_locate_sessions_root_is_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("root.txt");
        File::create(&file).unwrap();

        assert!(matches!(
            locate_sessions(&file),
            Err(PipelineError::RootNotFound(_))
        ));
    }

    #[test]
    fn test_session_file_join() {
        let session = Session::new(PathBuf::from("/data/A"));
        assert_eq!(session.name, "A");
        assert_eq!(session.file("Odom.txt"), PathBuf::from("/data/A/Odom.txt"));
    }
}
