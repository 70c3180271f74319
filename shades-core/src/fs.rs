//! Checkout access used by source discovery and file checks.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Read access to a project checkout.
#[cfg_attr(test, mockall::automock)]
pub trait FileSystem: Send + Sync {
    /// Every regular file below `root`, version-control metadata excluded.
    fn list_files(&self, root: &Path) -> Result<Vec<PathBuf>>;
    /// Read a source file.
    fn read_to_string(&self, path: &Path) -> Result<String>;
}

/// Directories holding version-control metadata; never descended into.
const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// Checkout access backed by `std::fs`.
#[derive(Debug, Default, Clone)]
pub struct StdFileSystem;

impl StdFileSystem {
    /// Create a new standard filesystem adapter.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for StdFileSystem {
    fn list_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        collect_files(root, &mut files)?;
        files.sort();
        Ok(files)
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Gather regular files below `dir`. Symlinks are not followed.
fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let name = entry.file_name();
            if !VCS_DIRS.iter().any(|vcs| name == *vcs) {
                collect_files(&entry.path(), files)?;
            }
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::StdFileSystem;
    use crate::fs::FileSystem;

    #[test]
    fn std_filesystem_lists_and_reads_files() {
        let root = tempfile::tempdir().expect("temp dir");
        let file_path = root.path().join("hello.py");
        std::fs::write(&file_path, "print('hello')\n").expect("write test file");

        let fs = StdFileSystem::new();
        let files = fs.list_files(root.path()).expect("list files");
        assert_eq!(files, vec![file_path.clone()]);

        let contents = fs.read_to_string(&file_path).expect("read file");
        assert_eq!(contents, "print('hello')\n");
    }

    #[test]
    fn std_filesystem_prunes_version_control_metadata() {
        let root = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(root.path().join(".git")).expect("git dir");
        std::fs::write(root.path().join(".git").join("HEAD"), "ref").expect("git file");
        std::fs::create_dir_all(root.path().join(".hg")).expect("hg dir");
        std::fs::write(root.path().join(".hg").join("hgrc"), "").expect("hg file");
        std::fs::write(root.path().join(".env"), "X=1").expect("dotfile");
        std::fs::create_dir_all(root.path().join("pkg")).expect("pkg dir");
        std::fs::write(root.path().join("pkg").join("mod.py"), "x = 1\n").expect("source");

        let files = StdFileSystem::new()
            .list_files(root.path())
            .expect("list files");

        assert_eq!(
            files,
            vec![root.path().join(".env"), root.path().join("pkg").join("mod.py")]
        );
    }

    #[test]
    fn read_missing_file_is_io_error() {
        let root = tempfile::tempdir().expect("temp dir");
        let result = StdFileSystem::new().read_to_string(&root.path().join("missing.py"));
        assert!(matches!(result, Err(crate::ShadesError::Io(_))));
    }
}
