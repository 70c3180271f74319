//! Structural comparison of two analyses.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::diff::{line_changes, unified_diff};
use crate::domain::{Analysis, FileResult, ProjectResult};

/// Which analyses contain a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Presence {
    /// Present in both analyses.
    Both,
    /// Present only in the first analysis.
    OnlyFirst,
    /// Present only in the second analysis.
    OnlySecond,
}

/// How a file differs between the analyses.
#[derive(Debug, Clone, Copy)]
pub enum Disposition<'a> {
    /// Recorded in both with different outcomes.
    Modified {
        /// Result in the first analysis.
        first: &'a FileResult,
        /// Result in the second analysis.
        second: &'a FileResult,
        /// Lines only in the second side's output.
        added: usize,
        /// Lines only in the first side's output.
        removed: usize,
    },
    /// Recorded only in the first analysis.
    OnlyInFirst {
        /// The recorded result.
        result: &'a FileResult,
    },
    /// Recorded only in the second analysis.
    OnlyInSecond {
        /// The recorded result.
        result: &'a FileResult,
    },
}

/// One changed file.
#[derive(Debug, Clone, Copy)]
pub struct Change<'a> {
    /// Path relative to the project root.
    pub path: &'a str,
    /// How it changed.
    pub disposition: Disposition<'a>,
}

impl Change<'_> {
    /// `(added, removed)` lines between the two outputs; zero unless
    /// modified with neither side failed.
    pub fn line_changes(&self) -> (usize, usize) {
        match self.disposition {
            Disposition::Modified { added, removed, .. } => (added, removed),
            _ => (0, 0),
        }
    }

    /// Unified diff from the first side's output to the second's.
    ///
    /// A failed side renders as `[Kind: message]` and the opposite side,
    /// when it did not fail, as `[no crash]`.
    pub fn diff(&self) -> String {
        let (first, second) = match self.disposition {
            Disposition::Modified { first, second, .. } => {
                if first.failure().is_some() || second.failure().is_some() {
                    (failure_text(first), failure_text(second))
                } else {
                    (output_text(first), output_text(second))
                }
            }
            Disposition::OnlyInFirst { result } => (output_text(result), String::new()),
            Disposition::OnlyInSecond { result } => (String::new(), output_text(result)),
        };
        unified_diff(
            &first,
            &second,
            &format!("a/{}", self.path),
            &format!("b/{}", self.path),
        )
    }
}

fn output_text(result: &FileResult) -> String {
    match result.output_text() {
        Some(text) => text.to_string(),
        None => failure_text(result),
    }
}

fn failure_text(result: &FileResult) -> String {
    match result.failure() {
        Some(failure) => format!("{failure}\n"),
        None => "[no crash]\n".to_string(),
    }
}

/// Comparison of one project.
#[derive(Debug, Clone)]
pub struct ProjectComparison<'a> {
    /// Project name.
    pub name: &'a str,
    /// Which sides contain the project.
    pub presence: Presence,
    /// Whether both sides recorded the project at different revisions.
    pub revisions_differ: bool,
    /// Changed files, ordered by path.
    pub changes: Vec<Change<'a>>,
}

impl ProjectComparison<'_> {
    /// Whether any file changed.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Totals over all changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonTotals {
    /// Files with at least one change.
    pub changed_files: usize,
    /// Projects with at least one changed file.
    pub changed_projects: usize,
    /// Lines added across modified files.
    pub added: usize,
    /// Lines removed across modified files.
    pub removed: usize,
}

/// Size of the union of both analyses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedTotals {
    /// Source lines.
    pub lines: usize,
    /// Files.
    pub files: usize,
    /// Projects.
    pub projects: usize,
}

/// Structural difference between two analyses.
#[derive(Debug, Clone)]
pub struct ComparisonResult<'a> {
    /// Compared projects ordered by name.
    pub projects: Vec<ProjectComparison<'a>>,
    /// Totals over all changes.
    pub totals: ComparisonTotals,
    /// Size of what was compared.
    pub scanned: ScannedTotals,
}

impl<'a> ComparisonResult<'a> {
    /// Whether anything changed.
    pub fn differences_found(&self) -> bool {
        self.totals.changed_files > 0
    }

    /// Every change, with its project name.
    pub fn changes<'s>(&'s self) -> impl Iterator<Item = (&'a str, &'s Change<'a>)> + 's {
        self.projects
            .iter()
            .flat_map(|project| project.changes.iter().map(move |change| (project.name, change)))
    }
}

/// Compare two analyses, optionally restricted to `filter` project names.
pub fn compare<'a>(
    first: &'a Analysis,
    second: &'a Analysis,
    filter: Option<&BTreeSet<String>>,
) -> ComparisonResult<'a> {
    let names: BTreeSet<&'a str> = first
        .projects()
        .keys()
        .chain(second.projects().keys())
        .map(String::as_str)
        .filter(|name| filter.is_none_or(|filter| filter.contains(*name)))
        .collect();

    let mut projects = Vec::with_capacity(names.len());
    let mut totals = ComparisonTotals::default();
    let mut scanned = ScannedTotals::default();

    for name in names {
        let comparison = match (first.project(name), second.project(name)) {
            (Some(a), Some(b)) => compare_projects(name, a, b, &mut scanned),
            (Some(a), None) => one_sided(name, a, Presence::OnlyFirst, &mut scanned),
            (None, Some(b)) => one_sided(name, b, Presence::OnlySecond, &mut scanned),
            (None, None) => continue,
        };
        scanned.projects += 1;

        if comparison.has_changes() {
            totals.changed_projects += 1;
        }
        for change in &comparison.changes {
            let (added, removed) = change.line_changes();
            totals.changed_files += 1;
            totals.added += added;
            totals.removed += removed;
        }
        projects.push(comparison);
    }

    ComparisonResult {
        projects,
        totals,
        scanned,
    }
}

fn compare_projects<'a>(
    name: &'a str,
    first: &'a ProjectResult,
    second: &'a ProjectResult,
    scanned: &mut ScannedTotals,
) -> ProjectComparison<'a> {
    let mut paths: BTreeMap<&'a str, (Option<&'a FileResult>, Option<&'a FileResult>)> =
        BTreeMap::new();
    for file in first.files() {
        paths.entry(file.path()).or_default().0 = Some(file);
    }
    for file in second.files() {
        paths.entry(file.path()).or_default().1 = Some(file);
    }

    let mut changes = Vec::new();
    for (path, sides) in paths {
        scanned.files += 1;
        let disposition = match sides {
            (Some(a), Some(b)) => {
                scanned.lines += a.line_count();
                if a.same_outcome(b) {
                    continue;
                }
                let (added, removed) = match (a.output_text(), b.output_text()) {
                    (Some(a_text), Some(b_text)) => line_changes(a_text, b_text),
                    _ => (0, 0),
                };
                Disposition::Modified {
                    first: a,
                    second: b,
                    added,
                    removed,
                }
            }
            (Some(a), None) => {
                scanned.lines += a.line_count();
                Disposition::OnlyInFirst { result: a }
            }
            (None, Some(b)) => {
                scanned.lines += b.line_count();
                Disposition::OnlyInSecond { result: b }
            }
            (None, None) => continue,
        };
        changes.push(Change { path, disposition });
    }

    ProjectComparison {
        name,
        presence: Presence::Both,
        revisions_differ: first.info().revision != second.info().revision,
        changes,
    }
}

fn one_sided<'a>(
    name: &'a str,
    project: &'a ProjectResult,
    presence: Presence,
    scanned: &mut ScannedTotals,
) -> ProjectComparison<'a> {
    let changes = project
        .files()
        .iter()
        .map(|result| {
            scanned.files += 1;
            scanned.lines += result.line_count();
            let disposition = match presence {
                Presence::OnlySecond => Disposition::OnlyInSecond { result },
                _ => Disposition::OnlyInFirst { result },
            };
            Change {
                path: result.path(),
                disposition,
            }
        })
        .collect();

    ProjectComparison {
        name,
        presence,
        revisions_differ: false,
        changes,
    }
}
