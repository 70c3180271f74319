//! Durable analysis artifacts.
//!
//! Analyses are stored as pretty-printed JSON, optionally inside a gzip
//! container when the destination ends in `.gz`. Loading sniffs the gzip
//! magic bytes instead of trusting the file name, checks the schema version
//! before anything else, and validates every record so a corrupt artifact
//! never yields a half-populated [`Analysis`].

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::FormatterConfig;
use crate::domain::{
    Analysis, Failure, FailureKind, FileResult, FileStatus, Outcome, ProjectInfo, ProjectResult,
    SCHEMA_VERSION,
};
use crate::error::{Result, ShadesError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Container suffixes that cannot be written; only gzip is supported.
const UNSUPPORTED_CONTAINERS: &[&str] = &["zip", "bz2", "xz", "zst", "7z", "tar", "tgz"];

/// Physical encoding of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Plain JSON text.
    Plain,
    /// Gzip-compressed JSON.
    Gzip,
}

impl Encoding {
    /// Encoding chosen for a destination path.
    ///
    /// Fails for compressed containers other than gzip instead of silently
    /// writing plain JSON under a misleading name.
    pub fn for_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("gz") => Ok(Self::Gzip),
            Some(ext)
                if UNSUPPORTED_CONTAINERS
                    .iter()
                    .any(|container| ext.eq_ignore_ascii_case(container)) =>
            {
                Err(ShadesError::serialization(
                    path,
                    format!("unsupported container .{ext}; use .gz or plain JSON"),
                ))
            }
            _ => Ok(Self::Plain),
        }
    }

    /// Encoding detected from an artifact's leading bytes.
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            Self::Gzip
        } else {
            Self::Plain
        }
    }
}

/// Write `analysis` to `path`, compressing when the path ends in `.gz`.
pub fn save(analysis: &Analysis, path: &Path) -> Result<()> {
    let bytes = to_bytes(analysis, Encoding::for_path(path)?)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Read an analysis written by [`save`].
pub fn load(path: &Path) -> Result<Analysis> {
    let bytes = std::fs::read(path)
        .map_err(|err| ShadesError::serialization(path, format!("cannot read file: {err}")))?;
    from_bytes(&bytes, path)
}

/// Encode an analysis.
pub fn to_bytes(analysis: &Analysis, encoding: Encoding) -> Result<Vec<u8>> {
    let mut text = serde_json::to_string_pretty(&AnalysisRecord::from(analysis))?;
    text.push('\n');
    match encoding {
        Encoding::Plain => Ok(text.into_bytes()),
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(text.as_bytes())?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decode an analysis; `path` is only used in error messages.
pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Analysis> {
    let text = match Encoding::detect(bytes) {
        Encoding::Plain => bytes.to_vec(),
        Encoding::Gzip => {
            let mut decoded = Vec::new();
            GzDecoder::new(bytes)
                .read_to_end(&mut decoded)
                .map_err(|err| {
                    ShadesError::serialization(path, format!("corrupt gzip container: {err}"))
                })?;
            decoded
        }
    };

    let value: Value = serde_json::from_slice(&text)
        .map_err(|err| ShadesError::serialization(path, format!("malformed JSON: {err}")))?;
    check_version(&value, path)?;
    let record: AnalysisRecord = serde_json::from_value(value)
        .map_err(|err| ShadesError::serialization(path, err))?;
    record.into_analysis(path)
}

fn check_version(value: &Value, path: &Path) -> Result<()> {
    let Some(object) = value.as_object() else {
        return Err(ShadesError::serialization(path, "expected a JSON object"));
    };
    let Some(version) = object.get("version") else {
        return Err(ShadesError::serialization(path, "missing schema version"));
    };
    match version.as_u64() {
        Some(found) if found >= 1 && found <= u64::from(SCHEMA_VERSION) => Ok(()),
        _ => Err(ShadesError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: version.to_string(),
        }),
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisRecord {
    version: u32,
    generated_at: DateTime<Utc>,
    formatter_identity: String,
    #[serde(default)]
    config_overrides: FormatterConfig,
    #[serde(default)]
    partial: bool,
    projects: BTreeMap<String, ProjectRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectRecord {
    #[serde(default)]
    url: String,
    #[serde(default)]
    revision: String,
    #[serde(default)]
    custom_arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    setup_error: Option<String>,
    #[serde(default)]
    files: BTreeMap<String, FileRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRecord {
    status: FileStatus,
    #[serde(default)]
    line_count: Option<usize>,
    #[serde(default)]
    added_lines: usize,
    #[serde(default)]
    removed_lines: usize,
    #[serde(default)]
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    formatted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_excerpt: Option<String>,
}

impl From<&Analysis> for AnalysisRecord {
    fn from(analysis: &Analysis) -> Self {
        Self {
            version: analysis.schema_version(),
            generated_at: analysis.created_at(),
            formatter_identity: analysis.formatter().to_string(),
            config_overrides: analysis.config().clone(),
            partial: analysis.is_partial(),
            projects: analysis
                .projects()
                .iter()
                .map(|(name, project)| (name.clone(), ProjectRecord::from(project)))
                .collect(),
        }
    }
}

impl From<&ProjectResult> for ProjectRecord {
    fn from(project: &ProjectResult) -> Self {
        let info = project.info();
        Self {
            url: info.url.clone(),
            revision: info.revision.clone(),
            custom_arguments: info.custom_arguments.clone(),
            setup_error: project.setup_error().map(str::to_string),
            files: project
                .files()
                .iter()
                .map(|file| (file.path().to_string(), FileRecord::from(file)))
                .collect(),
        }
    }
}

impl From<&FileResult> for FileRecord {
    fn from(file: &FileResult) -> Self {
        let (added_lines, removed_lines) = file.line_changes();
        let failure = file.failure();
        Self {
            status: file.status(),
            line_count: Some(file.line_count()),
            added_lines,
            removed_lines,
            source: file.source().to_string(),
            formatted: file.formatted().map(str::to_string),
            failure_kind: failure.map(|failure| failure.kind),
            message: failure.map(|failure| failure.message.clone()),
            traceback: failure.and_then(|failure| failure.traceback.clone()),
            log_excerpt: failure.and_then(|failure| failure.log.clone()),
        }
    }
}

impl AnalysisRecord {
    fn into_analysis(self, path: &Path) -> Result<Analysis> {
        self.config_overrides
            .validate()
            .map_err(|err| ShadesError::serialization(path, format!("configOverrides: {err}")))?;
        if self.projects.is_empty() {
            return Err(ShadesError::serialization(path, "analysis has no projects"));
        }

        let mut projects = BTreeMap::new();
        for (name, record) in self.projects {
            let project = record.into_project(&name, path)?;
            projects.insert(name, project);
        }
        Ok(Analysis::from_parts(
            self.generated_at,
            self.formatter_identity,
            self.config_overrides,
            self.partial,
            projects,
        ))
    }
}

impl ProjectRecord {
    fn into_project(self, name: &str, path: &Path) -> Result<ProjectResult> {
        let info = ProjectInfo {
            name: name.to_string(),
            url: self.url,
            revision: self.revision,
            custom_arguments: self.custom_arguments,
        };
        let mut files = Vec::with_capacity(self.files.len());
        for (file_path, record) in self.files {
            let file = record.into_file(file_path).map_err(|reason| {
                ShadesError::serialization(path, format!("project {name}: {reason}"))
            })?;
            files.push(file);
        }
        Ok(ProjectResult::from_parts(info, self.setup_error, files))
    }
}

impl FileRecord {
    fn into_file(self, file_path: String) -> std::result::Result<FileResult, String> {
        let outcome = match self.status {
            FileStatus::Unchanged => Outcome::Unchanged,
            FileStatus::Reformatted => {
                let Some(formatted) = self.formatted else {
                    return Err(format!("{file_path}: reformatted file without formatted text"));
                };
                if self.added_lines == 0 && self.removed_lines == 0 {
                    return Err(format!("{file_path}: reformatted file without line changes"));
                }
                Outcome::Reformatted {
                    formatted,
                    added: self.added_lines,
                    removed: self.removed_lines,
                }
            }
            FileStatus::Failed => {
                let Some(kind) = self.failure_kind else {
                    return Err(format!("{file_path}: failed file without failure kind"));
                };
                Outcome::Failed(Failure {
                    kind,
                    message: self.message.unwrap_or_default(),
                    traceback: self.traceback,
                    log: self.log_excerpt,
                })
            }
        };
        let line_count = self
            .line_count
            .unwrap_or_else(|| self.source.matches('\n').count())
            .max(1);
        Ok(FileResult::from_parts(
            file_path,
            self.source,
            line_count,
            outcome,
        ))
    }
}
