//! Acquiring project checkouts and finding their sources.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use log::{debug, info, warn};
use shades_core::aggregate::aggregate_setup_failure;
use shades_core::{ProjectInfo, ProjectResult, SourceDiscovery, SourceFile, StdFileSystem};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::CliResult;
use crate::catalog::ProjectSpec;

/// A checked-out project ready for analysis.
#[derive(Debug)]
pub(crate) struct Checkout {
    pub(crate) info: ProjectInfo,
    pub(crate) sources: Vec<SourceFile>,
}

#[derive(Debug)]
pub(crate) enum Prepared {
    Ready(Checkout),
    /// Setup failed; recorded as is in the analysis.
    Failed(ProjectResult),
}

impl Prepared {
    pub(crate) fn name(&self) -> &str {
        match self {
            Prepared::Ready(checkout) => &checkout.info.name,
            Prepared::Failed(result) => result.name(),
        }
    }
}

/// Check out every project under `work_dir`, at most `concurrency` at once.
///
/// Results are ordered by project name. A project that cannot be set up is
/// returned as [`Prepared::Failed`].
pub(crate) async fn setup_projects(
    projects: Vec<ProjectSpec>,
    work_dir: &Path,
    concurrency: usize,
    languages: Vec<String>,
) -> CliResult<Vec<Prepared>> {
    let concurrency = if concurrency == 0 { 1 } else { concurrency };
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let languages = Arc::new(languages);
    let mut tasks = JoinSet::new();
    let mut specs = HashMap::new();

    for spec in projects {
        let permit = semaphore.clone().acquire_owned().await?;
        let target = work_dir.join(&spec.name);
        let languages = languages.clone();
        let task_spec = spec.clone();
        let handle = tasks.spawn(async move {
            let _permit = permit;
            prepare(task_spec, target, languages).await
        });
        specs.insert(handle.id(), spec);
    }

    let mut prepared = Vec::with_capacity(specs.len());
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((_, project)) => prepared.push(project),
            Err(err) => {
                if let Some(spec) = specs.get(&err.id()) {
                    prepared.push(Prepared::Failed(failed_setup(spec, err.to_string())));
                }
            }
        }
    }
    prepared.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(prepared)
}

async fn prepare(spec: ProjectSpec, target: PathBuf, languages: Arc<Vec<String>>) -> Prepared {
    match checkout(&spec, &target, languages).await {
        Ok(checkout) => Prepared::Ready(checkout),
        Err(err) => {
            warn!("could not set up {}: {err}", spec.name);
            Prepared::Failed(failed_setup(&spec, err.to_string()))
        }
    }
}

fn failed_setup(spec: &ProjectSpec, error: String) -> ProjectResult {
    let info = ProjectInfo::new(
        &spec.name,
        &spec.url,
        spec.revision.clone().unwrap_or_default(),
    )
    .with_custom_arguments(spec.custom_arguments.clone());
    aggregate_setup_failure(info, error)
}

async fn checkout(
    spec: &ProjectSpec,
    target: &Path,
    languages: Arc<Vec<String>>,
) -> CliResult<Checkout> {
    if can_reuse(spec, target).await {
        info!("using existing clone of {} - {}", spec.name, spec.url);
    } else {
        clone_repo(&spec.url, target, spec.revision.as_deref()).await?;
        info!("cloned {} - {}", spec.name, spec.url);
    }

    let revision = head_revision(target).await?;
    debug!("{} is at {revision}", spec.name);

    let root = target.to_path_buf();
    let sources = tokio::task::spawn_blocking(move || {
        SourceDiscovery::with_languages(StdFileSystem::new(), languages.as_ref().clone())
            .discover(&root)
    })
    .await??;
    debug!("{} has {} source files", spec.name, sources.len());

    Ok(Checkout {
        info: ProjectInfo::new(&spec.name, &spec.url, revision)
            .with_custom_arguments(spec.custom_arguments.clone()),
        sources,
    })
}

async fn can_reuse(spec: &ProjectSpec, target: &Path) -> bool {
    if !target.join(".git").exists() {
        return false;
    }
    match &spec.revision {
        None => true,
        Some(wanted) => match head_revision(target).await {
            Ok(current) => current.starts_with(wanted.as_str()),
            Err(_) => false,
        },
    }
}

/// Clone `url` into `dest`: a shallow clone of the default branch, or
/// exactly `revision` when one is pinned.
pub(crate) async fn clone_repo(url: &str, dest: &Path, revision: Option<&str>) -> CliResult<()> {
    match revision {
        None => {
            if dest.exists() {
                return Err(format!("destination exists: {}", dest.display()).into());
            }
            let mut command = Command::new("git");
            command
                .arg("clone")
                .arg("--quiet")
                .arg("--depth")
                .arg("1")
                .arg(url)
                .arg(dest);
            run_git(command, "clone").await?;
        }
        Some(revision) => {
            tokio::fs::create_dir_all(dest).await?;
            let mut init = Command::new("git");
            init.arg("init").arg("--quiet").current_dir(dest);
            run_git(init, "init").await?;

            let mut fetch = Command::new("git");
            fetch
                .arg("fetch")
                .arg("--quiet")
                .arg(url)
                .arg(revision)
                .current_dir(dest);
            run_git(fetch, "fetch").await?;

            let mut checkout = Command::new("git");
            checkout
                .arg("checkout")
                .arg("--quiet")
                .arg("--force")
                .arg(revision)
                .current_dir(dest);
            run_git(checkout, "checkout").await?;
        }
    }
    Ok(())
}

/// Full revision id of the checkout's `HEAD`.
pub(crate) async fn head_revision(repo: &Path) -> CliResult<String> {
    let mut command = Command::new("git");
    command.arg("rev-parse").arg("HEAD").current_dir(repo);
    run_git(command, "rev-parse").await
}

async fn run_git(mut command: Command, action: &str) -> CliResult<String> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "git {action} failed with status {}: {}",
            output.status,
            stderr.trim()
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::{Prepared, clone_repo, head_revision, setup_projects};
    use crate::catalog::ProjectSpec;
    use std::path::{Path, PathBuf};
    use std::process::Command;

    fn init_git_repo(root: &Path) -> String {
        std::fs::create_dir_all(root.join("pkg")).expect("create repo");
        Command::new("git")
            .args(["init", "-q"])
            .current_dir(root)
            .status()
            .expect("git init");
        std::fs::write(root.join("setup.py"), "x = 1\n").expect("write setup");
        std::fs::write(root.join("pkg/mod.py"), "y = 2\n").expect("write module");
        std::fs::write(root.join("README.md"), "shades").expect("write readme");
        Command::new("git")
            .args(["add", "."])
            .current_dir(root)
            .status()
            .expect("git add");
        Command::new("git")
            .args([
                "-c",
                "user.name=Shades",
                "-c",
                "user.email=shades@example.com",
                "commit",
                "-q",
                "-m",
                "init",
            ])
            .current_dir(root)
            .status()
            .expect("git commit");
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(root)
            .output()
            .expect("git rev-parse");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn spec(name: &str, url: &Path, revision: Option<&str>) -> ProjectSpec {
        ProjectSpec {
            name: name.to_string(),
            url: url.display().to_string(),
            revision: revision.map(str::to_string),
            custom_arguments: vec!["-S".to_string()],
        }
    }

    fn source_paths(prepared: &Prepared) -> Vec<String> {
        match prepared {
            Prepared::Ready(checkout) => checkout
                .sources
                .iter()
                .map(|source| source.relative.clone())
                .collect(),
            Prepared::Failed(result) => panic!("setup failed: {:?}", result.setup_error()),
        }
    }

    #[tokio::test]
    async fn clone_repo_clones_and_reports_failures() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let source = scratch.path().join("source");
        let sha = init_git_repo(&source);
        let dest = scratch.path().join("dest");

        clone_repo(&source.display().to_string(), &dest, None)
            .await
            .expect("clone succeeds");
        assert_eq!(head_revision(&dest).await.expect("revision"), sha);

        let missing: PathBuf = scratch.path().join("missing");
        let result = clone_repo(
            &missing.display().to_string(),
            &scratch.path().join("bad"),
            None,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn clone_repo_checks_out_pinned_revision() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let source = scratch.path().join("source");
        let sha = init_git_repo(&source);
        let dest = scratch.path().join("pinned");

        clone_repo(&source.display().to_string(), &dest, Some(&sha))
            .await
            .expect("pinned clone");
        assert_eq!(head_revision(&dest).await.expect("revision"), sha);
    }

    #[tokio::test]
    async fn setup_projects_discovers_sources_and_records_failures() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let source = scratch.path().join("source");
        let sha = init_git_repo(&source);
        let work = scratch.path().join("work");
        std::fs::create_dir_all(&work).expect("work dir");

        let projects = vec![
            spec("zeta", &source, None),
            spec("broken", &scratch.path().join("nowhere"), None),
        ];
        let prepared = setup_projects(projects, &work, 2, vec!["Python".to_string()])
            .await
            .expect("setup");

        assert_eq!(prepared.len(), 2);
        match &prepared[0] {
            Prepared::Failed(result) => {
                assert_eq!(result.name(), "broken");
                assert!(result.setup_error().is_some());
            }
            Prepared::Ready(_) => panic!("expected broken project to fail"),
        }
        assert_eq!(source_paths(&prepared[1]), vec!["pkg/mod.py", "setup.py"]);
        if let Prepared::Ready(checkout) = &prepared[1] {
            assert_eq!(checkout.info.revision, sha);
            assert_eq!(checkout.info.custom_arguments, vec!["-S"]);
        }
    }

    #[tokio::test]
    async fn setup_projects_reuses_matching_clone() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let source = scratch.path().join("source");
        let sha = init_git_repo(&source);
        let work = scratch.path().join("work");
        std::fs::create_dir_all(&work).expect("work dir");

        let first = setup_projects(
            vec![spec("demo", &source, Some(&sha))],
            &work,
            1,
            vec!["Python".to_string()],
        )
        .await
        .expect("setup");
        assert_eq!(source_paths(&first[0]).len(), 2);

        std::fs::write(work.join("demo/extra.py"), "z = 3\n").expect("write extra");
        let second = setup_projects(
            vec![spec("demo", &source, Some(&sha[..12]))],
            &work,
            1,
            vec!["Python".to_string()],
        )
        .await
        .expect("setup");
        assert_eq!(
            source_paths(&second[0]),
            vec!["extra.py", "pkg/mod.py", "setup.py"]
        );
    }
}
