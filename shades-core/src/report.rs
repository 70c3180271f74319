//! Report formatting utilities for analyses and comparisons.

use std::fmt::Write;

use serde::Serialize;

use crate::aggregate::{AnalysisSummary, summarize};
use crate::compare::{ComparisonResult, ComparisonTotals, Disposition, Presence, ScannedTotals};
use crate::domain::{Analysis, FailureKind, FileResult, FileStatus, ProjectResult, ProjectSummary};

/// Format an integer, grouping thousands with spaces from 10 000 up.
pub fn fmt_int(number: usize) -> String {
    let digits = number.to_string();
    if number < 10_000 {
        return digits;
    }
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(digit);
    }
    grouped
}

/// JSON view of an analysis summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport<'a> {
    /// Formatter identity.
    pub formatter: &'a str,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Whether the run was interrupted.
    pub partial: bool,
    /// Formatter arguments used for every file.
    pub arguments: Vec<String>,
    /// Whole-analysis totals.
    pub summary: AnalysisSummary,
    /// Per-project rows.
    pub projects: Vec<ProjectRow<'a>>,
}

/// JSON view of one project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRow<'a> {
    /// Project name.
    pub name: &'a str,
    /// Revision analysed.
    pub revision: &'a str,
    /// Overall result.
    pub result: FileStatus,
    /// Counts.
    pub summary: ProjectSummary,
    /// Setup error, if any.
    pub setup_error: Option<&'a str>,
}

impl<'a> AnalysisReport<'a> {
    /// Build the view for `analysis`.
    pub fn new(analysis: &'a Analysis) -> Self {
        Self {
            formatter: analysis.formatter(),
            created_at: analysis.created_at().to_rfc3339(),
            partial: analysis.is_partial(),
            arguments: analysis.config().to_args(),
            summary: summarize(analysis),
            projects: analysis
                .projects()
                .values()
                .map(|project| ProjectRow {
                    name: project.name(),
                    revision: &project.info().revision,
                    result: project.overall_status(),
                    summary: project.summary(),
                    setup_error: project.setup_error(),
                })
                .collect(),
        }
    }
}

/// JSON view of a comparison.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonReport<'a> {
    /// Change totals.
    pub totals: ComparisonTotals,
    /// Size of what was compared.
    pub scanned: ScannedTotals,
    /// One row per changed file.
    pub changes: Vec<ChangeRow<'a>>,
}

/// JSON view of one changed file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRow<'a> {
    /// Project name.
    pub project: &'a str,
    /// File path.
    pub path: &'a str,
    /// `modified`, `only-in-first`, or `only-in-second`.
    pub disposition: &'static str,
    /// Lines added.
    pub added: usize,
    /// Lines removed.
    pub removed: usize,
}

impl<'a> ComparisonReport<'a> {
    /// Build the view for `result`.
    pub fn new(result: &ComparisonResult<'a>) -> Self {
        Self {
            totals: result.totals,
            scanned: result.scanned,
            changes: result
                .changes()
                .map(|(project, change)| {
                    let (added, removed) = change.line_changes();
                    ChangeRow {
                        project,
                        path: change.path,
                        disposition: disposition_name(&change.disposition),
                        added,
                        removed,
                    }
                })
                .collect(),
        }
    }
}

fn disposition_name(disposition: &Disposition<'_>) -> &'static str {
    match disposition {
        Disposition::Modified { .. } => "modified",
        Disposition::OnlyInFirst { .. } => "only-in-first",
        Disposition::OnlyInSecond { .. } => "only-in-second",
    }
}

/// Render any serializable report payload as JSON.
pub fn render_json<T: Serialize + ?Sized>(payload: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(payload)
}

/// Render an analysis summary and project table as plain text.
pub fn render_analysis_text(analysis: &Analysis) -> String {
    let summary = summarize(analysis);
    let mut output = String::new();
    let _ = writeln!(
        output,
        "Summary ({}, {} UTC){}",
        analysis.formatter(),
        analysis.created_at().format("%b %d %Y %H:%M:%S"),
        if analysis.is_partial() { " [partial]" } else { "" }
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "{:<14}{:>10}{:>14}", "Result", "# files", "# projects");
    for status in FileStatus::ALL {
        let _ = writeln!(
            output,
            "{:<14}{:>10}{:>14}",
            status.as_str(),
            fmt_int(summary.files.count(status)),
            fmt_int(summary.projects_with(status))
        );
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "# of lines: {}", fmt_int(summary.files.lines));
    let _ = writeln!(output, "# of files: {}", fmt_int(summary.files.files()));
    let _ = writeln!(output, "# of projects: {}", fmt_int(summary.projects()));
    let _ = writeln!(
        output,
        "{} changes in total: {} additions - {} deletions",
        fmt_int(summary.files.added + summary.files.removed),
        fmt_int(summary.files.added),
        fmt_int(summary.files.removed)
    );
    let arguments = analysis.config().to_args();
    if !arguments.is_empty() {
        let _ = writeln!(output, "Custom arguments: {}", arguments.join(" "));
    }
    let _ = writeln!(output);
    append_project_table(&mut output, analysis);
    output
}

/// Render an analysis summary as Markdown.
pub fn render_analysis_markdown(analysis: &Analysis) -> String {
    let summary = summarize(analysis);
    let mut output = String::new();
    let _ = writeln!(output, "# Analysis Summary\n");
    let _ = writeln!(output, "- Formatter: `{}`", analysis.formatter());
    let _ = writeln!(output, "- Created: {}", analysis.created_at().to_rfc3339());
    if analysis.is_partial() {
        let _ = writeln!(output, "- Partial: run was interrupted");
    }
    let arguments = analysis.config().to_args();
    if !arguments.is_empty() {
        let _ = writeln!(output, "- Custom arguments: `{}`", arguments.join(" "));
    }
    let _ = writeln!(output);

    let _ = writeln!(output, "| Result | # files | # projects |");
    let _ = writeln!(output, "| --- | ---: | ---: |");
    for status in FileStatus::ALL {
        let _ = writeln!(
            output,
            "| {} | {} | {} |",
            status,
            fmt_int(summary.files.count(status)),
            fmt_int(summary.projects_with(status))
        );
    }
    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "{} lines, {} files, {} projects; {} changes (+{}/-{})\n",
        fmt_int(summary.files.lines),
        fmt_int(summary.files.files()),
        fmt_int(summary.projects()),
        fmt_int(summary.files.added + summary.files.removed),
        fmt_int(summary.files.added),
        fmt_int(summary.files.removed)
    );

    let _ = writeln!(output, "## Projects\n");
    let _ = writeln!(
        output,
        "| Name | Results (u/r/f) | Line changes (+/-) | # files | # lines |"
    );
    let _ = writeln!(output, "| --- | --- | --- | ---: | ---: |");
    for project in analysis.projects().values() {
        let counts = project.summary();
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} |",
            project.name(),
            result_counts(&counts),
            line_change_cell(&counts),
            fmt_int(counts.files()),
            fmt_int(counts.lines)
        );
    }
    output
}

fn append_project_table(output: &mut String, analysis: &Analysis) {
    let name_width = analysis
        .projects()
        .keys()
        .map(String::len)
        .max()
        .unwrap_or(0)
        .max("Name".len());
    let _ = writeln!(
        output,
        "{:<name_width$}  {:<16}  {:<26}  {:>8}  {:>8}",
        "Name", "Results (u/r/f)", "Line changes (total +/-)", "# files", "# lines"
    );
    for project in analysis.projects().values() {
        let counts = project.summary();
        let results = match project.setup_error() {
            Some(_) => "setup failed".to_string(),
            None => result_counts(&counts),
        };
        let _ = writeln!(
            output,
            "{:<name_width$}  {:<16}  {:<26}  {:>8}  {:>8}",
            project.name(),
            results,
            line_change_cell(&counts),
            fmt_int(counts.files()),
            fmt_int(counts.lines)
        );
    }
}

fn result_counts(counts: &ProjectSummary) -> String {
    format!("{}/{}/{}", counts.unchanged, counts.reformatted, counts.failed)
}

fn line_change_cell(counts: &ProjectSummary) -> String {
    if counts.added == 0 && counts.removed == 0 {
        return "n/a".to_string();
    }
    format!(
        "{} [{}/{}]",
        fmt_int(counts.added + counts.removed),
        fmt_int(counts.added),
        fmt_int(counts.removed)
    )
}

/// List one project's files with their results.
pub fn render_project_text(project: &ProjectResult) -> String {
    let mut output = String::new();
    let info = project.info();
    let _ = writeln!(output, "{} - {}", project.name(), info.url);
    if !info.revision.is_empty() {
        let _ = writeln!(output, "revision: {}", info.revision);
    }
    if !info.custom_arguments.is_empty() {
        let _ = writeln!(output, "custom arguments: {}", info.custom_arguments.join(" "));
    }
    if let Some(error) = project.setup_error() {
        let _ = writeln!(output, "setup failed: {error}");
        return output;
    }
    for file in project.files() {
        match file.status() {
            FileStatus::Reformatted => {
                let (added, removed) = file.line_changes();
                let _ = writeln!(output, "  {} reformatted [+{added}/-{removed}]", file.path());
            }
            status => {
                let _ = writeln!(output, "  {} {status}", file.path());
            }
        }
    }
    let counts = project.summary();
    let _ = writeln!(
        output,
        "{} files: {}",
        fmt_int(counts.files()),
        result_counts(&counts)
    );
    output
}

/// Render one file's result: a diff when reformatted, the failure when
/// failed.
pub fn render_file_text(file: &FileResult) -> String {
    match file.status() {
        FileStatus::Unchanged => "Nothing changed.\n".to_string(),
        FileStatus::Reformatted => {
            let formatted = file.formatted().unwrap_or_default();
            crate::diff::unified_diff(
                file.source(),
                formatted,
                &format!("a/{}", file.path()),
                &format!("b/{}", file.path()),
            )
        }
        FileStatus::Failed => match file.failure() {
            Some(failure) => format!("{}\n-> {}\n", failure.kind, failure.message),
            None => String::new(),
        },
    }
}

/// Look up a named field of a file result.
///
/// Recognised fields are `source`, `formatted`, `message`, `traceback`
/// and `log`; `None` means the file has no such field.
pub fn file_field<'a>(file: &'a FileResult, field: &str) -> Option<&'a str> {
    let failure = file.failure();
    match field {
        "source" => Some(file.source()),
        "formatted" => file.formatted(),
        "message" => failure.map(|failure| failure.message.as_str()),
        "traceback" => failure.and_then(|failure| failure.traceback.as_deref()),
        "log" => failure.and_then(|failure| failure.log.as_deref()),
        _ => None,
    }
}

/// Render the comparison summary line.
pub fn render_comparison_text(result: &ComparisonResult<'_>) -> String {
    let mut output = String::new();
    for project in &result.projects {
        match project.presence {
            Presence::OnlyFirst => {
                let _ = writeln!(output, "note: {} is only in the first analysis", project.name);
            }
            Presence::OnlySecond => {
                let _ = writeln!(output, "note: {} is only in the second analysis", project.name);
            }
            Presence::Both if project.revisions_differ => {
                let _ = writeln!(
                    output,
                    "note: {} was analysed at different revisions",
                    project.name
                );
            }
            Presence::Both => {}
        }
    }
    if !result.differences_found() {
        let _ = writeln!(output, "Nothing changed.");
        return output;
    }

    let totals = &result.totals;
    let _ = writeln!(
        output,
        "{} projects & {} files changed / {} changes [+{}/-{}]",
        fmt_int(totals.changed_projects),
        fmt_int(totals.changed_files),
        fmt_int(totals.added + totals.removed),
        fmt_int(totals.added),
        fmt_int(totals.removed)
    );
    let _ = writeln!(
        output,
        "... out of {} lines, {} files & {} projects",
        fmt_int(result.scanned.lines),
        fmt_int(result.scanned.files),
        fmt_int(result.scanned.projects)
    );
    output
}

/// Render the comparison as Markdown.
pub fn render_comparison_markdown(result: &ComparisonResult<'_>) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# Comparison\n");
    if !result.differences_found() {
        let _ = writeln!(output, "Nothing changed.");
        return output;
    }
    let totals = &result.totals;
    let _ = writeln!(
        output,
        "{} projects & {} files changed, {} changes (+{}/-{}) out of {} lines, {} files & {} projects.\n",
        fmt_int(totals.changed_projects),
        fmt_int(totals.changed_files),
        fmt_int(totals.added + totals.removed),
        fmt_int(totals.added),
        fmt_int(totals.removed),
        fmt_int(result.scanned.lines),
        fmt_int(result.scanned.files),
        fmt_int(result.scanned.projects)
    );
    for project in result.projects.iter().filter(|project| project.has_changes()) {
        let _ = writeln!(output, "## {}\n", project.name);
        for change in &project.changes {
            let (added, removed) = change.line_changes();
            let _ = writeln!(
                output,
                "- `{}`: {} (+{}/-{})",
                change.path,
                disposition_name(&change.disposition),
                added,
                removed
            );
        }
        let _ = writeln!(output);
    }
    output
}

/// List changed files as `project: path (disposition)`.
pub fn render_change_list(result: &ComparisonResult<'_>) -> String {
    let mut output = String::new();
    for (project, change) in result.changes() {
        let _ = writeln!(
            output,
            "{project}: {} ({})",
            change.path,
            disposition_name(&change.disposition)
        );
    }
    output
}

/// Concatenate the diffs of every change, grouped by project.
pub fn render_change_diffs(result: &ComparisonResult<'_>) -> String {
    let mut output = String::new();
    for project in result.projects.iter().filter(|project| project.has_changes()) {
        let _ = writeln!(output, "[{}]", project.name);
        for change in &project.changes {
            output.push_str(&change.diff());
        }
        let _ = writeln!(output);
    }
    output
}

/// One failed file, as listed by `show-failed`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRow<'a> {
    /// Project name.
    pub project: &'a str,
    /// File path.
    pub path: &'a str,
    /// Failure kind.
    pub kind: FailureKind,
    /// Failure message.
    pub message: &'a str,
}

/// Failed-file listing for `show-failed`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureListing<'a> {
    /// Rendered text.
    #[serde(skip)]
    pub text: String,
    /// Every failed file.
    pub failures: Vec<FailureRow<'a>>,
    /// Projects whose setup failed, with the error.
    pub setup_failures: Vec<(&'a str, &'a str)>,
    /// Failed files listed.
    pub failed_files: usize,
    /// Projects with at least one failure.
    pub failed_projects: usize,
}

/// List failed files, optionally for one project only.
pub fn render_failures<'a>(analysis: &'a Analysis, project: Option<&str>) -> FailureListing<'a> {
    let mut listing = FailureListing::default();
    let projects = analysis
        .projects()
        .values()
        .filter(|candidate| project.is_none_or(|name| candidate.name() == name));
    for candidate in projects {
        append_project_failures(&mut listing, candidate);
    }
    let _ = writeln!(listing.text, "# of failed files: {}", listing.failed_files);
    let _ = writeln!(
        listing.text,
        "# of failed projects: {}",
        listing.failed_projects
    );
    listing
}

fn append_project_failures<'a>(listing: &mut FailureListing<'a>, project: &'a ProjectResult) {
    let failed: Vec<&FileResult> = project
        .files()
        .iter()
        .filter(|file| file.status() == FileStatus::Failed)
        .collect();
    if failed.is_empty() && project.setup_error().is_none() {
        return;
    }

    let _ = writeln!(listing.text, "{}:", project.name());
    if let Some(error) = project.setup_error() {
        let _ = writeln!(listing.text, "  setup failed: {error}");
        listing.setup_failures.push((project.name(), error));
    }
    for (number, file) in failed.iter().enumerate() {
        if let Some(failure) = file.failure() {
            let _ = writeln!(
                listing.text,
                "  {}. {}: {} - {}",
                number + 1,
                file.path(),
                failure.kind,
                failure.message
            );
            listing.failures.push(FailureRow {
                project: project.name(),
                path: file.path(),
                kind: failure.kind,
                message: &failure.message,
            });
        }
    }
    let _ = writeln!(listing.text);
    listing.failed_files += failed.len();
    listing.failed_projects += 1;
}
