//! Folding per-file outcomes into project and analysis summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::FormatterConfig;
use crate::domain::{
    Analysis, AnalysisBuilder, FileResult, FileStatus, ProjectInfo, ProjectResult, ProjectSummary,
};
use crate::error::Result;
use crate::pool::TaskOutcome;

/// Count files by status and sum line statistics.
pub fn tally<'a>(files: impl IntoIterator<Item = &'a FileResult>) -> ProjectSummary {
    files
        .into_iter()
        .fold(ProjectSummary::default(), |mut summary, file| {
            summary.lines += file.line_count();
            match file.status() {
                FileStatus::Unchanged => summary.unchanged += 1,
                FileStatus::Reformatted => {
                    let (added, removed) = file.line_changes();
                    summary.reformatted += 1;
                    summary.added += added;
                    summary.removed += removed;
                }
                FileStatus::Failed => summary.failed += 1,
            }
            summary
        })
}

/// Build a project result from its file outcomes.
///
/// Results are ordered by path; if a path appears more than once the
/// first occurrence wins.
pub fn aggregate(info: ProjectInfo, mut results: Vec<FileResult>) -> ProjectResult {
    results.sort_by(|a, b| a.path().cmp(b.path()));
    results.dedup_by(|later, earlier| later.path() == earlier.path());
    ProjectResult::new(info, results)
}

/// Record a project whose sources could not be set up.
pub fn aggregate_setup_failure(info: ProjectInfo, error: impl Into<String>) -> ProjectResult {
    ProjectResult::setup_failed(info, error)
}

/// Split pool outcomes by project name.
pub fn group_by_project(outcomes: Vec<TaskOutcome>) -> BTreeMap<String, Vec<FileResult>> {
    let mut grouped: BTreeMap<String, Vec<FileResult>> = BTreeMap::new();
    for outcome in outcomes {
        grouped
            .entry(outcome.project)
            .or_default()
            .push(outcome.result);
    }
    grouped
}

/// Assemble an analysis from finished project results.
pub fn combine(
    formatter: impl Into<String>,
    config: FormatterConfig,
    projects: Vec<ProjectResult>,
    partial: bool,
    created_at: DateTime<Utc>,
) -> Result<Analysis> {
    let mut builder = AnalysisBuilder::new(formatter, config);
    for project in projects {
        builder.add_project(project)?;
    }
    if partial {
        builder.mark_partial();
    }
    builder.seal(created_at)
}

/// Whole-analysis totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    /// Files per status.
    pub files: ProjectSummary,
    /// Projects whose overall result is unchanged.
    pub projects_unchanged: usize,
    /// Projects whose overall result is reformatted.
    pub projects_reformatted: usize,
    /// Projects whose overall result is failed.
    pub projects_failed: usize,
}

impl AnalysisSummary {
    /// Number of projects.
    pub fn projects(&self) -> usize {
        self.projects_unchanged + self.projects_reformatted + self.projects_failed
    }

    /// Projects with the given overall result.
    pub fn projects_with(&self, status: FileStatus) -> usize {
        match status {
            FileStatus::Unchanged => self.projects_unchanged,
            FileStatus::Reformatted => self.projects_reformatted,
            FileStatus::Failed => self.projects_failed,
        }
    }
}

/// Summarize every project of an analysis.
pub fn summarize(analysis: &Analysis) -> AnalysisSummary {
    let mut summary = AnalysisSummary {
        files: tally(
            analysis
                .projects()
                .values()
                .flat_map(|project| project.files()),
        ),
        ..AnalysisSummary::default()
    };
    for project in analysis.projects().values() {
        match project.overall_status() {
            FileStatus::Unchanged => summary.projects_unchanged += 1,
            FileStatus::Reformatted => summary.projects_reformatted += 1,
            FileStatus::Failed => summary.projects_failed += 1,
        }
    }
    summary
}

/// Overall result of a whole analysis, by the same precedence as projects.
pub fn overall_status(analysis: &Analysis) -> FileStatus {
    analysis
        .projects()
        .values()
        .map(ProjectResult::overall_status)
        .max()
        .unwrap_or(FileStatus::Unchanged)
}
