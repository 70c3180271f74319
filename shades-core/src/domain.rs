//! Domain entities for shades analyses.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FormatterConfig;
use crate::diff::line_changes;
use crate::error::{Result, ShadesError};

/// Schema version written into every analysis artifact.
pub const SCHEMA_VERSION: u32 = 1;

/// Classification of a single file after running the formatter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum FileStatus {
    /// The formatter left the file untouched.
    Unchanged,
    /// The formatter produced a stable, different output.
    Reformatted,
    /// The formatter failed on the file.
    Failed,
}

impl FileStatus {
    /// Every status, in severity order.
    pub const ALL: [FileStatus; 3] = [Self::Unchanged, Self::Reformatted, Self::Failed];

    /// Stable lowercase name used in artifacts and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Reformatted => "reformatted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a file failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The formatter errored for a reason other than unparsable input.
    Crash,
    /// The formatter rejected the input as unparsable.
    ParseFailure,
    /// A second formatting pass changed the first pass's output.
    Instability,
}

impl FailureKind {
    /// Stable kebab-case name used in artifacts.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::ParseFailure => "parse-failure",
            Self::Instability => "instability",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crash => f.write_str("Crash"),
            Self::ParseFailure => f.write_str("ParseFailure"),
            Self::Instability => f.write_str("Instability"),
        }
    }
}

/// Details recorded for a failed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Failure classification.
    pub kind: FailureKind,
    /// One-line description.
    pub message: String,
    /// Captured diagnostic output, if any.
    pub traceback: Option<String>,
    /// Log excerpt written by the formatter, or the pass-to-pass diff for
    /// unstable files.
    pub log: Option<String>,
}

impl Failure {
    /// Build a failure with only a kind and message.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traceback: None,
            log: None,
        }
    }

    /// Build a crash failure.
    pub fn crash(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Crash, message)
    }

    /// Build a parse failure.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ParseFailure, message)
    }

    /// Attach a traceback.
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Attach a log excerpt.
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}: {}]", self.kind, self.message)
    }
}

/// Result of formatting one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Output identical to input.
    Unchanged,
    /// Output differs from input and is stable under re-application.
    Reformatted {
        /// Formatted text.
        formatted: String,
        /// Lines present only in the formatted text.
        added: usize,
        /// Lines present only in the source text.
        removed: usize,
    },
    /// The formatter failed.
    Failed(Failure),
}

impl Outcome {
    /// Classify a formatted text against its source, computing line stats.
    pub fn from_texts(source: &str, formatted: String) -> Self {
        if source == formatted {
            return Self::Unchanged;
        }
        let (added, removed) = line_changes(source, &formatted);
        Self::Reformatted {
            formatted,
            added,
            removed,
        }
    }

    /// Status of this outcome.
    pub fn status(&self) -> FileStatus {
        match self {
            Self::Unchanged => FileStatus::Unchanged,
            Self::Reformatted { .. } => FileStatus::Reformatted,
            Self::Failed(_) => FileStatus::Failed,
        }
    }
}

/// Per-file record in an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResult {
    path: String,
    source: String,
    line_count: usize,
    outcome: Outcome,
}

impl FileResult {
    /// Record an outcome for `path` (relative to the project root).
    ///
    /// A reformatted outcome is re-derived from its formatted text, so the
    /// line counts always match the texts and a "reformatted" output equal
    /// to the source is recorded as unchanged.
    pub fn new(path: impl Into<String>, source: impl Into<String>, outcome: Outcome) -> Self {
        let source = source.into();
        let outcome = match outcome {
            Outcome::Reformatted { formatted, .. } => Outcome::from_texts(&source, formatted),
            other => other,
        };
        Self {
            path: path.into(),
            line_count: count_lines(&source),
            source,
            outcome,
        }
    }

    /// Record an unchanged file.
    pub fn unchanged(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(path, source, Outcome::Unchanged)
    }

    /// Record a formatter output, classifying it as unchanged or reformatted.
    pub fn reformatted(
        path: impl Into<String>,
        source: impl Into<String>,
        formatted: impl Into<String>,
    ) -> Self {
        let outcome = Outcome::Reformatted {
            formatted: formatted.into(),
            added: 0,
            removed: 0,
        };
        Self::new(path, source, outcome)
    }

    /// Record a failed file.
    pub fn failed(path: impl Into<String>, source: impl Into<String>, failure: Failure) -> Self {
        Self::new(path, source, Outcome::Failed(failure))
    }

    pub(crate) fn from_parts(
        path: String,
        source: String,
        line_count: usize,
        outcome: Outcome,
    ) -> Self {
        Self {
            path,
            source,
            line_count,
            outcome,
        }
    }

    /// Path relative to the project root, `/`-separated.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Original source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of lines in the source (never zero).
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    /// Recorded outcome.
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Status derived from the outcome.
    pub fn status(&self) -> FileStatus {
        self.outcome.status()
    }

    /// `(added, removed)` line counts; zero unless reformatted.
    pub fn line_changes(&self) -> (usize, usize) {
        match &self.outcome {
            Outcome::Reformatted { added, removed, .. } => (*added, *removed),
            _ => (0, 0),
        }
    }

    /// Formatted text for reformatted files.
    pub fn formatted(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Reformatted { formatted, .. } => Some(formatted),
            _ => None,
        }
    }

    /// Failure details for failed files.
    pub fn failure(&self) -> Option<&Failure> {
        match &self.outcome {
            Outcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// The text the formatter left behind: the formatted text when
    /// reformatted, the source when unchanged, nothing when failed.
    pub fn output_text(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Unchanged => Some(&self.source),
            Outcome::Reformatted { formatted, .. } => Some(formatted),
            Outcome::Failed(_) => None,
        }
    }

    /// Whether two results for the same path recorded the same behavior.
    ///
    /// Reformatted results must agree on the produced text; failures must
    /// agree on kind and message.
    pub fn same_outcome(&self, other: &FileResult) -> bool {
        match (&self.outcome, &other.outcome) {
            (Outcome::Unchanged, Outcome::Unchanged) => true,
            (
                Outcome::Reformatted { formatted: a, .. },
                Outcome::Reformatted { formatted: b, .. },
            ) => a == b,
            (Outcome::Failed(a), Outcome::Failed(b)) => a.kind == b.kind && a.message == b.message,
            _ => false,
        }
    }
}

fn count_lines(source: &str) -> usize {
    source.matches('\n').count().max(1)
}

/// Identity of a project within an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    /// Unique project name.
    pub name: String,
    /// Source URL.
    pub url: String,
    /// Resolved revision identifier; empty when unknown.
    pub revision: String,
    /// Extra formatter arguments used for this project only.
    pub custom_arguments: Vec<String>,
}

impl ProjectInfo {
    /// Create project info without custom arguments.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            revision: revision.into(),
            custom_arguments: Vec::new(),
        }
    }

    /// Attach project-specific formatter arguments.
    pub fn with_custom_arguments(mut self, arguments: Vec<String>) -> Self {
        self.custom_arguments = arguments;
        self
    }
}

/// Derived counts for one project or a set of files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    /// Unchanged files.
    pub unchanged: usize,
    /// Reformatted files.
    pub reformatted: usize,
    /// Failed files.
    pub failed: usize,
    /// Lines added over reformatted files.
    pub added: usize,
    /// Lines removed over reformatted files.
    pub removed: usize,
    /// Source lines over all files.
    pub lines: usize,
}

impl ProjectSummary {
    /// Number of files counted.
    pub fn files(&self) -> usize {
        self.unchanged + self.reformatted + self.failed
    }

    /// Count for one status.
    pub fn count(&self, status: FileStatus) -> usize {
        match status {
            FileStatus::Unchanged => self.unchanged,
            FileStatus::Reformatted => self.reformatted,
            FileStatus::Failed => self.failed,
        }
    }
}

/// All results recorded for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectResult {
    info: ProjectInfo,
    setup_error: Option<String>,
    files: Vec<FileResult>,
}

impl ProjectResult {
    /// Create a project result; files are ordered by path.
    pub fn new(info: ProjectInfo, mut files: Vec<FileResult>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            info,
            setup_error: None,
            files,
        }
    }

    /// Record a project whose sources could not be acquired.
    pub fn setup_failed(info: ProjectInfo, error: impl Into<String>) -> Self {
        Self {
            info,
            setup_error: Some(error.into()),
            files: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        info: ProjectInfo,
        setup_error: Option<String>,
        files: Vec<FileResult>,
    ) -> Self {
        let mut project = Self::new(info, files);
        project.setup_error = setup_error;
        project
    }

    /// Project identity.
    pub fn info(&self) -> &ProjectInfo {
        &self.info
    }

    /// Project name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Setup error, if acquisition failed.
    pub fn setup_error(&self) -> Option<&str> {
        self.setup_error.as_deref()
    }

    /// File results ordered by path.
    pub fn files(&self) -> &[FileResult] {
        &self.files
    }

    /// Look up one file by its relative path.
    pub fn file(&self, path: &str) -> Option<&FileResult> {
        self.files
            .binary_search_by(|file| file.path.as_str().cmp(path))
            .ok()
            .map(|index| &self.files[index])
    }

    /// Derived counts.
    pub fn summary(&self) -> ProjectSummary {
        crate::aggregate::tally(&self.files)
    }

    /// Failed if anything failed (setup included), else reformatted if
    /// anything was reformatted, else unchanged.
    pub fn overall_status(&self) -> FileStatus {
        if self.setup_error.is_some() {
            return FileStatus::Failed;
        }
        self.files
            .iter()
            .map(FileResult::status)
            .max()
            .unwrap_or(FileStatus::Unchanged)
    }
}

/// A complete recording of one formatter run over a set of projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    schema_version: u32,
    created_at: DateTime<Utc>,
    formatter: String,
    config: FormatterConfig,
    partial: bool,
    projects: BTreeMap<String, ProjectResult>,
}

impl Analysis {
    pub(crate) fn from_parts(
        created_at: DateTime<Utc>,
        formatter: String,
        config: FormatterConfig,
        partial: bool,
        projects: BTreeMap<String, ProjectResult>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            created_at,
            formatter,
            config,
            partial,
            projects,
        }
    }

    /// Schema version of this analysis.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// When the analysis was sealed.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Formatter identity and version.
    pub fn formatter(&self) -> &str {
        &self.formatter
    }

    /// Formatter configuration used for the run.
    pub fn config(&self) -> &FormatterConfig {
        &self.config
    }

    /// Whether the run was interrupted before every file was checked.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Projects keyed by name.
    pub fn projects(&self) -> &BTreeMap<String, ProjectResult> {
        &self.projects
    }

    /// Look up one project.
    pub fn project(&self, name: &str) -> Option<&ProjectResult> {
        self.projects.get(name)
    }
}

/// Incremental construction of an [`Analysis`] during a run.
#[derive(Debug, Clone)]
pub struct AnalysisBuilder {
    formatter: String,
    config: FormatterConfig,
    partial: bool,
    projects: BTreeMap<String, ProjectResult>,
}

impl AnalysisBuilder {
    /// Start an analysis for the given formatter identity and configuration.
    pub fn new(formatter: impl Into<String>, config: FormatterConfig) -> Self {
        Self {
            formatter: formatter.into(),
            config,
            partial: false,
            projects: BTreeMap::new(),
        }
    }

    /// Add a project; names must be unique.
    pub fn add_project(&mut self, project: ProjectResult) -> Result<()> {
        let name = project.name().to_string();
        if self.projects.contains_key(&name) {
            return Err(ShadesError::Other(format!("duplicate project: {name}")));
        }
        self.projects.insert(name, project);
        Ok(())
    }

    /// Flag the analysis as interrupted.
    pub fn mark_partial(&mut self) {
        self.partial = true;
    }

    /// Number of projects added so far.
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    /// Whether no project has been added.
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Finish construction.
    pub fn seal(self, created_at: DateTime<Utc>) -> Result<Analysis> {
        if self.projects.is_empty() {
            return Err(ShadesError::Other(
                "an analysis needs at least one project".to_string(),
            ));
        }
        Ok(Analysis::from_parts(
            created_at,
            self.formatter,
            self.config,
            self.partial,
            self.projects,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> ProjectInfo {
        ProjectInfo::new(name, format!("https://example.com/{name}.git"), "abc123")
    }

    #[test]
    fn reformatted_outcomes_are_rederived_from_texts() {
        let same = FileResult::new(
            "a.py",
            "x\n",
            Outcome::Reformatted {
                formatted: "x\n".to_string(),
                added: 0,
                removed: 0,
            },
        );
        assert_eq!(same.status(), FileStatus::Unchanged);

        let miscounted = FileResult::new(
            "b.py",
            "x=1\n",
            Outcome::Reformatted {
                formatted: "x = 1\n".to_string(),
                added: 7,
                removed: 0,
            },
        );
        assert_eq!(miscounted.status(), FileStatus::Reformatted);
        assert_eq!(miscounted.line_changes(), (1, 1));
    }

    #[test]
    fn reformatted_with_identical_text_is_unchanged() {
        let result = FileResult::reformatted("a.py", "x = 1\n", "x = 1\n");
        assert_eq!(result.status(), FileStatus::Unchanged);
        assert_eq!(result.line_changes(), (0, 0));
    }

    #[test]
    fn reformatted_records_line_stats() {
        let result = FileResult::reformatted("a.py", "x=1\ny = 2\n", "x = 1\ny = 2\n");
        assert_eq!(result.status(), FileStatus::Reformatted);
        assert_eq!(result.line_changes(), (1, 1));
        assert_eq!(result.formatted(), Some("x = 1\ny = 2\n"));
        assert_eq!(result.output_text(), Some("x = 1\ny = 2\n"));
    }

    #[test]
    fn line_count_is_never_zero() {
        assert_eq!(FileResult::unchanged("empty.py", "").line_count(), 1);
        assert_eq!(FileResult::unchanged("one.py", "x = 1").line_count(), 1);
        assert_eq!(FileResult::unchanged("two.py", "a\nb\n").line_count(), 2);
    }

    #[test]
    fn failed_results_compare_on_kind_and_message() {
        let a = FileResult::failed(
            "a.py",
            "x",
            Failure::parse("Cannot parse: 1:0").with_traceback("one"),
        );
        let b = FileResult::failed(
            "a.py",
            "x",
            Failure::parse("Cannot parse: 1:0").with_traceback("two"),
        );
        let c = FileResult::failed("a.py", "x", Failure::crash("Cannot parse: 1:0"));
        assert!(a.same_outcome(&b));
        assert!(!a.same_outcome(&c));
        assert!(!a.same_outcome(&FileResult::unchanged("a.py", "x")));
    }

    #[test]
    fn project_result_sorts_files_and_derives_status() {
        let project = ProjectResult::new(
            info("p"),
            vec![
                FileResult::unchanged("b.py", "b\n"),
                FileResult::reformatted("a.py", "a=1\n", "a = 1\n"),
            ],
        );
        let paths: Vec<&str> = project.files().iter().map(FileResult::path).collect();
        assert_eq!(paths, vec!["a.py", "b.py"]);
        assert_eq!(project.overall_status(), FileStatus::Reformatted);
        assert!(project.file("b.py").is_some());
        assert!(project.file("c.py").is_none());
    }

    #[test]
    fn setup_failure_marks_project_failed() {
        let project = ProjectResult::setup_failed(info("p"), "clone failed");
        assert_eq!(project.overall_status(), FileStatus::Failed);
        assert_eq!(project.setup_error(), Some("clone failed"));
        assert_eq!(project.summary().files(), 0);
    }

    #[test]
    fn empty_project_is_unchanged() {
        let project = ProjectResult::new(info("empty"), Vec::new());
        assert_eq!(project.overall_status(), FileStatus::Unchanged);
    }

    #[test]
    fn builder_rejects_duplicates_and_empty_analyses() {
        let mut builder = AnalysisBuilder::new("black 24.1.0", FormatterConfig::default());
        builder
            .add_project(ProjectResult::new(info("p"), Vec::new()))
            .expect("first insert");
        let duplicate = builder.add_project(ProjectResult::new(info("p"), Vec::new()));
        assert!(duplicate.is_err());

        let empty = AnalysisBuilder::new("black", FormatterConfig::default());
        assert!(empty.seal(Utc::now()).is_err());
    }

    #[test]
    fn sealed_analysis_carries_metadata() {
        let mut builder = AnalysisBuilder::new("black 24.1.0", FormatterConfig::default());
        builder
            .add_project(ProjectResult::new(info("p"), Vec::new()))
            .expect("insert");
        builder.mark_partial();
        let analysis = builder.seal(Utc::now()).expect("seal");
        assert_eq!(analysis.schema_version(), SCHEMA_VERSION);
        assert_eq!(analysis.formatter(), "black 24.1.0");
        assert!(analysis.is_partial());
        assert!(analysis.project("p").is_some());
    }

    #[test]
    fn failure_display_names_kind() {
        let failure = Failure::new(FailureKind::Instability, "unstable");
        assert_eq!(failure.to_string(), "[Instability: unstable]");
        assert_eq!(FailureKind::ParseFailure.as_str(), "parse-failure");
    }
}
