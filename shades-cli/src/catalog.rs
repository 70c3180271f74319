//! Project catalogs: the built-in project list, catalog files, and
//! projects replayed from an earlier analysis.

use std::collections::BTreeSet;
use std::path::Path;

use shades_core::Analysis;

use crate::CliResult;

/// A project to analyse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProjectSpec {
    pub(crate) name: String,
    pub(crate) url: String,
    /// Pinned revision; `None` checks out the default branch tip.
    pub(crate) revision: Option<String>,
    /// Formatter arguments appended for this project only.
    pub(crate) custom_arguments: Vec<String>,
}

impl ProjectSpec {
    fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            revision: None,
            custom_arguments: Vec::new(),
        }
    }

    fn with_arguments(mut self, arguments: &[&str]) -> Self {
        self.custom_arguments = arguments.iter().map(|arg| arg.to_string()).collect();
        self
    }
}

const BUILTIN: &[(&str, &str)] = &[
    ("aioexabgp", "https://github.com/cooperlees/aioexabgp.git"),
    ("attrs", "https://github.com/python-attrs/attrs.git"),
    ("bandersnatch", "https://github.com/pypa/bandersnatch.git"),
    ("blackbench", "https://github.com/ichard26/blackbench.git"),
    ("channels", "https://github.com/django/channels.git"),
    ("diff-shades", "https://github.com/ichard26/diff-shades.git"),
    ("django", "https://github.com/django/django.git"),
    ("flake8-bugbear", "https://github.com/PyCQA/flake8-bugbear.git"),
    ("hypothesis", "https://github.com/HypothesisWorks/hypothesis.git"),
    ("pandas", "https://github.com/pandas-dev/pandas.git"),
    ("pillow", "https://github.com/python-pillow/Pillow.git"),
    ("poetry", "https://github.com/python-poetry/poetry.git"),
    ("ptr", "https://github.com/facebookincubator/ptr.git"),
    ("pyanalyze", "https://github.com/quora/pyanalyze.git"),
    ("pyramid", "https://github.com/Pylons/pyramid.git"),
    ("pytest", "https://github.com/pytest-dev/pytest.git"),
    ("scikit-lego", "https://github.com/koaning/scikit-lego.git"),
    ("sqlalchemy", "https://github.com/sqlalchemy/sqlalchemy.git"),
    ("tox", "https://github.com/tox-dev/tox.git"),
    ("typeshed", "https://github.com/python/typeshed.git"),
    ("virtualenv", "https://github.com/pypa/virtualenv.git"),
    ("warehouse", "https://github.com/pypa/warehouse.git"),
];

/// Projects analysed when no catalog is given, ordered by name.
pub(crate) fn builtin_projects() -> Vec<ProjectSpec> {
    BUILTIN
        .iter()
        .map(|(name, url)| {
            let project = ProjectSpec::new(name, url);
            if *name == "django" {
                project.with_arguments(&["--skip-string-normalization"])
            } else {
                project
            }
        })
        .collect()
}

/// Parse a catalog: one `name url [revision]` entry per line.
///
/// A line holding only a URL names the project after the repository.
/// Blank lines and `#` comments are skipped.
pub(crate) fn parse_catalog(contents: &str) -> CliResult<Vec<ProjectSpec>> {
    let mut projects = Vec::new();
    let mut seen = BTreeSet::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let project = match fields.as_slice() {
            [url] => ProjectSpec::new(&repo_dir_name(url).to_lowercase(), url),
            [name, url] => ProjectSpec::new(&name.to_lowercase(), url),
            [name, url, revision] => ProjectSpec {
                revision: Some(revision.to_string()),
                ..ProjectSpec::new(&name.to_lowercase(), url)
            },
            _ => {
                return Err(format!(
                    "catalog line {}: expected `name url [revision]`",
                    number + 1
                )
                .into());
            }
        };
        if project.name.is_empty() {
            return Err(format!("catalog line {}: empty project name", number + 1).into());
        }
        if !seen.insert(project.name.clone()) {
            return Err(format!("catalog line {}: duplicate project {}", number + 1, project.name).into());
        }
        projects.push(project);
    }
    projects.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(projects)
}

/// Read and parse a catalog file.
pub(crate) async fn load_catalog(path: &Path) -> CliResult<Vec<ProjectSpec>> {
    let contents = tokio::fs::read_to_string(path).await?;
    parse_catalog(&contents)
}

/// The projects of an earlier analysis, pinned to the revisions it saw.
pub(crate) fn from_analysis(analysis: &Analysis) -> Vec<ProjectSpec> {
    analysis
        .projects()
        .values()
        .map(|project| {
            let info = project.info();
            ProjectSpec {
                name: info.name.clone(),
                url: info.url.clone(),
                revision: Some(info.revision.clone()).filter(|revision| !revision.is_empty()),
                custom_arguments: info.custom_arguments.clone(),
            }
        })
        .collect()
}

/// Apply `--select` and `--exclude`, both compared casefolded.
pub(crate) fn filter_projects(
    projects: Vec<ProjectSpec>,
    select: &[String],
    exclude: &[String],
) -> Vec<ProjectSpec> {
    let select: BTreeSet<String> = select.iter().map(|name| name.to_lowercase()).collect();
    let exclude: BTreeSet<String> = exclude.iter().map(|name| name.to_lowercase()).collect();
    projects
        .into_iter()
        .filter(|project| !exclude.contains(&project.name))
        .filter(|project| select.is_empty() || select.contains(&project.name))
        .collect()
}

pub(crate) fn repo_dir_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last_segment = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let last_segment = last_segment.rsplit(':').next().unwrap_or(last_segment);
    last_segment.trim_end_matches(".git").to_string()
}
