//! Confinement of file access to the configured roots.

use std::path::{Path, PathBuf};

use mediascan_core::{ScanError, ScanResult};

/// The set of directories a scan may touch.
#[derive(Debug, Clone, Default)]
pub struct RootSet {
    /// Roots as configured.
    configured: Vec<PathBuf>,
    /// Roots with symlinks resolved; missing roots are left out.
    resolved: Vec<PathBuf>,
}

impl RootSet {
    pub fn new(roots: &[PathBuf]) -> Self {
        let resolved = roots
            .iter()
            .filter_map(|root| root.canonicalize().ok())
            .collect();
        Self {
            configured: roots.to_vec(),
            resolved,
        }
    }

    /// Resolve `path` and check that it lies under a root.
    ///
    /// The returned path is the resolved one and is safe to open.
    pub fn sanitize(&self, path: &Path) -> ScanResult<PathBuf> {
        let resolved = path.canonicalize().map_err(|e| ScanError::io(path, e))?;
        if self.resolved.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(ScanError::OutsideRoots {
                path: path.to_path_buf(),
            })
        }
    }

    /// Lexical check that `path` lies under a root, without touching the disk.
    ///
    /// Used for paths that may no longer exist.
    pub fn contains(&self, path: &Path) -> bool {
        self.resolved
            .iter()
            .chain(self.configured.iter())
            .any(|root| path.starts_with(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_accepts_paths_under_root() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("shows")).unwrap();
        fs::write(temp.path().join("shows/a.mkv"), "a").unwrap();
        let roots = RootSet::new(&[temp.path().to_path_buf()]);

        let sanitized = roots.sanitize(&temp.path().join("shows/../shows/a.mkv")).unwrap();
        assert!(sanitized.ends_with("shows/a.mkv"));
    }

    #[test]
    fn test_sanitize_rejects_escape() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("library");
        fs::create_dir(&root).unwrap();
        fs::write(outer.path().join("private.mkv"), "x").unwrap();
        let roots = RootSet::new(&[root.clone()]);

        let escaped = root.join("../private.mkv");
        assert!(matches!(
            roots.sanitize(&escaped),
            Err(ScanError::OutsideRoots { .. })
        ));
    }

    #[test]
    fn test_sanitize_missing_file_is_io() {
        let temp = TempDir::new().unwrap();
        let roots = RootSet::new(&[temp.path().to_path_buf()]);
        assert!(matches!(
            roots.sanitize(&temp.path().join("gone.mkv")),
            Err(ScanError::Io { .. })
        ));
    }

    #[test]
    fn test_contains_is_lexical() {
        let roots = RootSet::new(&[PathBuf::from("/srv/videos")]);
        assert!(roots.contains(Path::new("/srv/videos/deleted.mkv")));
        assert!(!roots.contains(Path::new("/srv/other/a.mkv")));
    }
}
