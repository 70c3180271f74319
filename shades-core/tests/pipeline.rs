//! Runs an analysis end to end: discovery, checks, aggregation, the
//! artifact file, the cache, and a comparison against a second run.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use shades_core::cache::{AnalysisCache, CacheSettings, SystemClock};
use shades_core::compare::{Disposition, compare};
use shades_core::domain::{Analysis, Failure, FailureKind, FileStatus, ProjectInfo};
use shades_core::formatter::{Formatter, NoopFormatter};
use shades_core::pool::{FileTask, PoolConfig, StopSignal, WorkerPool};
use shades_core::{
    FormatterConfig, SourceDiscovery, StdFileSystem, aggregate, combine, group_by_project, serialize,
};

/// Strips trailing whitespace and refuses unbalanced parentheses.
struct TrimFormatter;

impl Formatter for TrimFormatter {
    fn identity(&self) -> String {
        "trim 1.0".to_string()
    }

    fn format(&self, source: &str, _path: &Path, _args: &[String]) -> Result<String, Failure> {
        if source.matches('(').count() != source.matches(')').count() {
            return Err(Failure::parse("Cannot parse: unbalanced parentheses"));
        }
        Ok(source
            .lines()
            .map(|line| format!("{}\n", line.trim_end()))
            .collect())
    }
}

fn write_project(root: &Path) {
    fs::create_dir_all(root.join("pkg")).expect("mkdir");
    fs::create_dir_all(root.join(".git")).expect("mkdir");
    fs::write(root.join("a.py"), "x = 1\n").expect("write");
    fs::write(root.join("pkg/b.py"), "y = 2   \nz = 3\n").expect("write");
    fs::write(root.join("pkg/c.py"), "call((\n").expect("write");
    fs::write(root.join("README.md"), "# readme   \n").expect("write");
    fs::write(root.join(".git/hidden.py"), "ignored = 1   \n").expect("write");
}

async fn analyze(formatter: Arc<dyn Formatter>, root: &Path) -> Analysis {
    let sources = SourceDiscovery::new(StdFileSystem::new())
        .discover(root)
        .expect("discover");
    let args = Arc::new(Vec::new());
    let tasks = sources
        .into_iter()
        .map(|source| FileTask {
            project: "p".to_string(),
            relative_path: source.relative,
            absolute_path: source.absolute,
            args: Arc::clone(&args),
        })
        .collect();

    let pool = WorkerPool::new(
        Arc::clone(&formatter),
        Arc::new(StdFileSystem::new()),
        PoolConfig {
            workers: 2,
            ..PoolConfig::default()
        },
    );
    let report = pool.run(tasks, StopSignal::never()).await;
    assert!(!report.interrupted);

    let projects = group_by_project(report.results)
        .into_iter()
        .map(|(name, files)| {
            aggregate(
                ProjectInfo::new(name, "https://example.com/p.git", "0123abc"),
                files,
            )
        })
        .collect();
    let created = Utc
        .with_ymd_and_hms(2024, 5, 6, 7, 8, 9)
        .single()
        .expect("date");
    combine(
        formatter.identity(),
        FormatterConfig::default(),
        projects,
        false,
        created,
    )
    .expect("analysis")
}

#[tokio::test]
async fn analysis_survives_storage_and_compares_against_a_baseline() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let root = workspace.path().join("p");
    write_project(&root);

    let trimmed = analyze(Arc::new(TrimFormatter), &root).await;
    let project = trimmed.project("p").expect("project");
    let paths: Vec<&str> = project.files().iter().map(|file| file.path()).collect();
    assert_eq!(paths, vec!["a.py", "pkg/b.py", "pkg/c.py"]);
    assert_eq!(project.file("a.py").map(|f| f.status()), Some(FileStatus::Unchanged));
    assert_eq!(project.file("pkg/b.py").map(|f| f.line_changes()), Some((1, 1)));
    assert_eq!(
        project
            .file("pkg/c.py")
            .and_then(|f| f.failure())
            .map(|failure| failure.kind),
        Some(FailureKind::ParseFailure)
    );

    let artifact = workspace.path().join("trimmed.json.gz");
    serialize::save(&trimmed, &artifact).expect("save");
    assert_eq!(serialize::load(&artifact).expect("load"), trimmed);

    let cache = AnalysisCache::in_memory(SystemClock, CacheSettings::default());
    let first = cache.fetch(&artifact).expect("fetch");
    assert!(!first.cached);
    let second = cache.fetch(&artifact).expect("fetch");
    assert!(second.cached);
    assert_eq!(*second.analysis, trimmed);

    let baseline = analyze(Arc::new(NoopFormatter), &root).await;
    let result = compare(&baseline, &second.analysis, None);

    assert_eq!(result.totals.changed_files, 2);
    assert_eq!(result.totals.changed_projects, 1);
    assert_eq!((result.totals.added, result.totals.removed), (1, 1));
    assert_eq!(result.scanned.files, 3);
    assert_eq!(result.scanned.projects, 1);

    let changed: Vec<(&str, bool)> = result
        .changes()
        .map(|(_, change)| {
            (
                change.path,
                matches!(change.disposition, Disposition::Modified { .. }),
            )
        })
        .collect();
    assert_eq!(changed, vec![("pkg/b.py", true), ("pkg/c.py", true)]);

    let reflexive = compare(&trimmed, &second.analysis, None);
    assert!(!reflexive.differences_found());
}
