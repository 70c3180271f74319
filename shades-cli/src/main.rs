#![deny(missing_docs)]
//! Shades command-line interface.
//!
//! Runs a code formatter over a corpus of projects, records what it did to
//! every file, and compares recorded analyses.

mod catalog;
mod setup;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, info, warn};
use shades_core::cache::{AnalysisCache, CacheSettings, SystemClock};
use shades_core::pool::{FileTask, PoolConfig, Progress, WorkerPool, stop_signal};
use shades_core::report::{
    AnalysisReport, ComparisonReport, file_field, render_analysis_markdown, render_analysis_text,
    render_change_diffs, render_change_list, render_comparison_markdown, render_comparison_text,
    render_failures, render_file_text, render_json, render_project_text,
};
use shades_core::serialize::Encoding;
use shades_core::{
    Analysis, CommandFormatter, Formatter, FormatterConfig, StdFileSystem, Style, aggregate,
    combine, compare, group_by_project, serialize,
};
use tokio::sync::mpsc;

use crate::catalog::ProjectSpec;
use crate::setup::{Prepared, setup_projects};

pub(crate) type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const EXIT_OK: i32 = 0;
const EXIT_CHECK_FAILED: i32 = 1;
const EXIT_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "shades", version, about = "Measure a code formatter's impact on real projects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Empty the analysis cache before running.
    #[arg(long, global = true)]
    clear_cache: bool,
    /// Output format for reports.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,
    /// Log debug output.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Directory holding cached analyses.
    #[arg(long, env = "SHADES_CACHE_DIR", global = true)]
    cache_dir: Option<PathBuf>,
}

#[derive(ValueEnum, Copy, Clone, Debug, Eq, PartialEq)]
enum OutputFormat {
    Text,
    Json,
    Markdown,
}

#[derive(Args, Clone, Debug)]
struct AnalyzeArgs {
    /// Where to write the analysis; a `.gz` suffix compresses it.
    results_path: PathBuf,
    /// Extra arguments passed to the formatter for every file.
    #[arg(last = true)]
    formatter_args: Vec<String>,
    /// Only analyse these projects (repeatable).
    #[arg(short, long)]
    select: Vec<String>,
    /// Skip these projects (repeatable).
    #[arg(short, long)]
    exclude: Vec<String>,
    /// Directory to clone projects into; existing clones are reused.
    #[arg(short, long)]
    work_dir: Option<PathBuf>,
    /// Analyse the projects and revisions recorded in an earlier analysis.
    #[arg(long)]
    repeat_projects_from: Option<PathBuf>,
    /// Catalog file with one `name url [revision]` entry per line.
    #[arg(long, conflicts_with = "repeat_projects_from")]
    projects: Option<PathBuf>,
    /// Maximum line length.
    #[arg(long)]
    line_length: Option<u32>,
    /// Format with the preview style.
    #[arg(long)]
    preview: bool,
    /// Leave string quotes alone.
    #[arg(long)]
    skip_string_normalization: bool,
    /// Parallel formatter runs; 0 uses one per CPU.
    #[arg(short = 'j', long, env = "SHADES_WORKERS", default_value_t = 0)]
    workers: usize,
    /// Formatter program to run.
    #[arg(long, env = "SHADES_FORMATTER", default_value = "black")]
    formatter: String,
    /// Languages of the files to format (repeatable).
    #[arg(long = "language", default_value = "Python")]
    languages: Vec<String>,
    /// Give up on a single file after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the formatter over every project and save the results.
    Analyze(AnalyzeArgs),
    /// Show results or metadata from an analysis.
    Show {
        /// Analysis file.
        analysis: PathBuf,
        /// Project to show.
        project: Option<String>,
        /// File within the project.
        file: Option<String>,
        /// One field of the file: source, formatted, message, traceback or log.
        field: Option<String>,
    },
    /// Compare two analyses for differences in the results.
    Compare {
        /// Baseline analysis.
        first: PathBuf,
        /// Analysis compared against the baseline.
        second: PathBuf,
        /// Only compare this project.
        project: Option<String>,
        /// Exit with 1 if differences were found.
        #[arg(long)]
        check: bool,
        /// Show a diff of the differences.
        #[arg(long, conflicts_with = "list")]
        diff: bool,
        /// List the differing files.
        #[arg(long)]
        list: bool,
    },
    /// List the files the formatter failed on.
    ShowFailed {
        /// Analysis file.
        analysis: PathBuf,
        /// Only list this project.
        project: Option<String>,
        /// Exit with 1 if any file failed.
        #[arg(long)]
        check: bool,
    },
}

#[cfg(not(test))]
#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            EXIT_ERROR
        }
    };
    // Formatter runs abandoned after an interrupt must not keep the process
    // alive.
    std::process::exit(code);
}

#[cfg(test)]
fn main() {}

#[cfg(not(test))]
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

async fn run(cli: Cli) -> CliResult<i32> {
    let format = cli.format;
    let cache = open_cache(cli.cache_dir.as_deref(), cli.clear_cache);

    match cli.command {
        Commands::Analyze(args) => run_analyze(args, &cache, format).await,
        Commands::Show {
            analysis,
            project,
            file,
            field,
        } => run_show(&cache, &analysis, project, file, field, format),
        Commands::Compare {
            first,
            second,
            project,
            check,
            diff,
            list,
        } => run_compare(
            &cache,
            &first,
            &second,
            project,
            CompareMode { check, diff, list },
            format,
        ),
        Commands::ShowFailed {
            analysis,
            project,
            check,
        } => run_show_failed(&cache, &analysis, project, check, format),
    }
}

fn open_cache(dir: Option<&Path>, clear: bool) -> AnalysisCache {
    let dir = dir
        .map(Path::to_path_buf)
        .or_else(|| dirs::cache_dir().map(|cache| cache.join("shades")));
    let cache = match dir {
        Some(dir) => match AnalysisCache::on_disk(dir.clone(), SystemClock, CacheSettings::default())
        {
            Ok(cache) => cache,
            Err(err) => {
                warn!(
                    "analysis cache unavailable at {}: {err}; using memory only",
                    dir.display()
                );
                AnalysisCache::in_memory(SystemClock, CacheSettings::default())
            }
        },
        None => AnalysisCache::in_memory(SystemClock, CacheSettings::default()),
    };

    if clear {
        match cache.clear() {
            Ok(()) => info!("cleared the analysis cache"),
            Err(err) => warn!("could not clear the analysis cache: {err}"),
        }
    }
    cache
}

fn load_analysis(cache: &AnalysisCache, path: &Path) -> CliResult<Arc<Analysis>> {
    let lookup = cache.fetch(path)?;
    debug!(
        "loaded {}{}",
        path.display(),
        if lookup.cached { " (cached)" } else { "" }
    );
    Ok(lookup.analysis)
}

enum WorkDir {
    Kept(PathBuf),
    Scratch(tempfile::TempDir),
}

impl WorkDir {
    fn path(&self) -> &Path {
        match self {
            WorkDir::Kept(path) => path,
            WorkDir::Scratch(dir) => dir.path(),
        }
    }
}

async fn run_analyze(args: AnalyzeArgs, cache: &AnalysisCache, format: OutputFormat) -> CliResult<i32> {
    if args.results_path.is_dir() {
        return Err(format!(
            "{} is a directory; refusing to overwrite it",
            args.results_path.display()
        )
        .into());
    }
    Encoding::for_path(&args.results_path)?;
    if args.results_path.exists() {
        warn!("overwriting {} as it already exists", args.results_path.display());
    }

    let config = formatter_config(&args)?;
    let projects = select_projects(&args, cache).await?;

    let program = args.formatter.clone();
    let mut formatter =
        tokio::task::spawn_blocking(move || CommandFormatter::detect(program)).await??;
    if let Some(seconds) = args.timeout {
        formatter = formatter.with_timeout(Duration::from_secs(seconds));
    }
    let formatter: Arc<dyn Formatter> = Arc::new(formatter);
    info!("analysing {} projects with {}", projects.len(), formatter.identity());

    let work_dir = match &args.work_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir).await?;
            WorkDir::Kept(dir.clone())
        }
        None => WorkDir::Scratch(tempfile::tempdir()?),
    };

    let pool_config = PoolConfig {
        workers: args.workers,
        task_timeout: args.timeout.map(Duration::from_secs),
        ..PoolConfig::default()
    };
    let prepared = setup_projects(
        projects,
        work_dir.path(),
        pool_config.effective_workers(),
        args.languages.clone(),
    )
    .await?;

    let tasks = file_tasks(&prepared, &config);
    let (stop, signal) = stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; finishing in-flight files (press Ctrl-C again to abort)");
            stop.stop();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(log_progress(progress_rx));
    let pool = WorkerPool::new(
        Arc::clone(&formatter),
        Arc::new(StdFileSystem::new()),
        pool_config,
    )
    .with_progress(progress_tx);
    let report = pool.run(tasks, signal).await;
    drop(pool);
    let _ = reporter.await;

    if report.interrupted {
        warn!(
            "run interrupted: {} files abandoned, {} never started; saving a partial analysis",
            report.abandoned, report.not_started
        );
    }

    let mut grouped = group_by_project(report.results);
    let projects = prepared
        .into_iter()
        .map(|project| match project {
            Prepared::Ready(checkout) => {
                let files = grouped.remove(&checkout.info.name).unwrap_or_default();
                aggregate(checkout.info, files)
            }
            Prepared::Failed(result) => result,
        })
        .collect();
    let analysis = combine(
        formatter.identity(),
        config,
        projects,
        report.interrupted,
        Utc::now(),
    )?;

    serialize::save(&analysis, &args.results_path)?;
    info!("saved analysis to {}", args.results_path.display());
    drop(work_dir);

    emit(&render_summary(&analysis, format)?);
    Ok(EXIT_OK)
}

fn formatter_config(args: &AnalyzeArgs) -> CliResult<FormatterConfig> {
    let mut builder = FormatterConfig::builder()
        .skip_string_normalization(args.skip_string_normalization)
        .extra_args(args.formatter_args.iter().cloned());
    if let Some(length) = args.line_length {
        builder = builder.line_length(length);
    }
    if args.preview {
        builder = builder.style(Style::Preview);
    }
    Ok(builder.build()?)
}

async fn select_projects(args: &AnalyzeArgs, cache: &AnalysisCache) -> CliResult<Vec<ProjectSpec>> {
    let projects = if let Some(path) = &args.repeat_projects_from {
        catalog::from_analysis(&*load_analysis(cache, path)?)
    } else if let Some(path) = &args.projects {
        catalog::load_catalog(path).await?
    } else {
        catalog::builtin_projects()
    };

    let projects = catalog::filter_projects(projects, &args.select, &args.exclude);
    if projects.is_empty() {
        return Err("no projects selected".into());
    }
    for project in &projects {
        FormatterConfig::builder()
            .extra_args(project.custom_arguments.iter().cloned())
            .build()
            .map_err(|err| format!("project {}: {err}", project.name))?;
    }
    Ok(projects)
}

fn file_tasks(prepared: &[Prepared], config: &FormatterConfig) -> Vec<FileTask> {
    let base_args = config.to_args();
    let mut tasks = Vec::new();
    for project in prepared {
        let Prepared::Ready(checkout) = project else {
            continue;
        };
        let mut project_args = base_args.clone();
        project_args.extend(checkout.info.custom_arguments.iter().cloned());
        let project_args = Arc::new(project_args);
        for source in &checkout.sources {
            tasks.push(FileTask {
                project: checkout.info.name.clone(),
                relative_path: source.relative.clone(),
                absolute_path: source.absolute.clone(),
                args: Arc::clone(&project_args),
            });
        }
    }
    tasks
}

async fn log_progress(mut progress: mpsc::UnboundedReceiver<Progress>) {
    while let Some(update) = progress.recv().await {
        debug!(
            "[{}/{}] {}/{}: {}",
            update.completed, update.total, update.project, update.path, update.status
        );
        let step = (update.total / 10).max(1);
        if update.completed % step == 0 || update.completed == update.total {
            info!("checked {}/{} files", update.completed, update.total);
        }
    }
}

fn render_summary(analysis: &Analysis, format: OutputFormat) -> CliResult<String> {
    Ok(match format {
        OutputFormat::Text => render_analysis_text(analysis),
        OutputFormat::Markdown => render_analysis_markdown(analysis),
        OutputFormat::Json => render_json(&AnalysisReport::new(analysis))?,
    })
}

fn run_show(
    cache: &AnalysisCache,
    path: &Path,
    project: Option<String>,
    file: Option<String>,
    field: Option<String>,
    format: OutputFormat,
) -> CliResult<i32> {
    let analysis = load_analysis(cache, path)?;
    let Some(project) = project else {
        emit(&render_summary(&analysis, format)?);
        return Ok(EXIT_OK);
    };

    let project = project.to_lowercase();
    let result = analysis
        .project(&project)
        .ok_or_else(|| format!("project {project} not found in {}", path.display()))?;
    let Some(file) = file else {
        let contents = match format {
            OutputFormat::Json => render_json(result)?,
            _ => render_project_text(result),
        };
        emit(&contents);
        return Ok(EXIT_OK);
    };

    let file_result = result
        .file(&file)
        .ok_or_else(|| format!("{file} couldn't be found under {project}"))?;
    let contents = match field {
        Some(field) => file_field(file_result, &field.to_lowercase())
            .ok_or_else(|| {
                format!(
                    "{file} has no {field} field (the file's status is {})",
                    file_result.status()
                )
            })?
            .to_string(),
        None => match format {
            OutputFormat::Json => render_json(file_result)?,
            _ => render_file_text(file_result),
        },
    };
    emit(&contents);
    Ok(EXIT_OK)
}

#[derive(Debug, Clone, Copy)]
struct CompareMode {
    check: bool,
    diff: bool,
    list: bool,
}

fn run_compare(
    cache: &AnalysisCache,
    first_path: &Path,
    second_path: &Path,
    project: Option<String>,
    mode: CompareMode,
    format: OutputFormat,
) -> CliResult<i32> {
    if mode.diff && mode.list {
        return Err("--diff and --list can't be used at the same time".into());
    }
    let first = load_analysis(cache, first_path)?;
    let second = load_analysis(cache, second_path)?;
    if first.config() != second.config() {
        warn!("the analyses were made with different formatter arguments");
    }

    let filter = match project {
        Some(name) => {
            let name = name.to_lowercase();
            if first.project(&name).is_none() && second.project(&name).is_none() {
                return Err(format!("project {name} is in neither analysis").into());
            }
            Some(BTreeSet::from([name]))
        }
        None => None,
    };
    let result = compare(&first, &second, filter.as_ref());

    let contents = match format {
        OutputFormat::Json => render_json(&ComparisonReport::new(&result))?,
        OutputFormat::Markdown => render_comparison_markdown(&result),
        OutputFormat::Text => {
            let mut contents = render_comparison_text(&result);
            if result.differences_found() {
                if mode.diff {
                    contents.push('\n');
                    contents.push_str(&render_change_diffs(&result));
                } else if mode.list {
                    contents.push('\n');
                    contents.push_str(&render_change_list(&result));
                }
            }
            contents
        }
    };
    emit(&contents);

    if mode.check && result.differences_found() {
        Ok(EXIT_CHECK_FAILED)
    } else {
        Ok(EXIT_OK)
    }
}

fn run_show_failed(
    cache: &AnalysisCache,
    path: &Path,
    project: Option<String>,
    check: bool,
    format: OutputFormat,
) -> CliResult<i32> {
    let analysis = load_analysis(cache, path)?;
    let project = project.map(|name| name.to_lowercase());
    if let Some(name) = &project {
        if analysis.project(name).is_none() {
            return Err(format!("project {name} not found in {}", path.display()).into());
        }
    }

    let listing = render_failures(&analysis, project.as_deref());
    let contents = match format {
        OutputFormat::Json => render_json(&listing)?,
        _ => listing.text.clone(),
    };
    emit(&contents);

    if check && listing.failed_files > 0 {
        Ok(EXIT_CHECK_FAILED)
    } else {
        Ok(EXIT_OK)
    }
}

fn emit(contents: &str) {
    if contents.ends_with('\n') {
        print!("{contents}");
    } else {
        println!("{contents}");
    }
}
