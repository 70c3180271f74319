//! Source discovery for project checkouts.

use std::path::{Path, PathBuf};

use tokei::{Config, LanguageType};

use crate::error::Result;
use crate::fs::FileSystem;

/// Language checked when none is configured.
pub const DEFAULT_LANGUAGE: &str = "Python";

/// A source file selected for formatting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the project root, `/`-separated.
    pub relative: String,
    /// Path on disk.
    pub absolute: PathBuf,
}

/// Finds source files of the configured languages using `tokei`'s
/// language detection.
pub struct SourceDiscovery<F: FileSystem> {
    fs: F,
    config: Config,
    languages: Vec<String>,
}

impl<F: FileSystem> SourceDiscovery<F> {
    /// Discover files of the default language.
    pub fn new(fs: F) -> Self {
        Self::with_languages(fs, vec![DEFAULT_LANGUAGE.to_string()])
    }

    /// Discover files of the given languages (matched case-insensitively
    /// against `tokei` language names).
    pub fn with_languages(fs: F, languages: Vec<String>) -> Self {
        Self {
            fs,
            config: Config::default(),
            languages: languages
                .into_iter()
                .map(|language| language.to_lowercase())
                .collect(),
        }
    }

    /// List matching sources under `root`, ordered by relative path.
    pub fn discover(&self, root: &Path) -> Result<Vec<SourceFile>> {
        let mut sources: Vec<SourceFile> = self
            .fs
            .list_files(root)?
            .into_iter()
            .filter(|path| !is_hidden(root, path) && self.matches(path))
            .map(|absolute| SourceFile {
                relative: relative_posix(root, &absolute),
                absolute,
            })
            .collect();
        sources.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(sources)
    }

    fn matches(&self, path: &Path) -> bool {
        let Some(language) = LanguageType::from_path(path, &self.config) else {
            return false;
        };
        let name = language.to_string().to_lowercase();
        self.languages.iter().any(|wanted| *wanted == name)
    }
}

/// Dotfiles and anything inside a dot-directory (`.tox`, `.venv`, ...) are
/// tool state rather than project sources.
fn is_hidden(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .any(|component| component.as_os_str().to_string_lossy().starts_with('.'))
}

fn relative_posix(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
