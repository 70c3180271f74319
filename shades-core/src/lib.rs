#![deny(missing_docs)]
//! Shades core library.
//!
//! This crate contains the domain types and analysis primitives that power
//! the `shades` formatter-impact tool: running a formatter over many
//! projects, recording what it did to every file, and comparing runs.

pub mod aggregate;
pub mod cache;
pub mod compare;
pub mod config;
pub mod diff;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod formatter;
pub mod fs;
pub mod invoker;
pub mod pool;
pub mod report;
/// Reading and writing analysis files.
pub mod serialize;

pub use aggregate::{AnalysisSummary, aggregate, combine, group_by_project, summarize};
pub use cache::{AnalysisCache, CacheSettings, Clock, Lookup, SystemClock};
pub use compare::{Change, ComparisonResult, Disposition, compare};
pub use config::{FormatterConfig, Style};
pub use discovery::{SourceDiscovery, SourceFile};
pub use domain::{
    Analysis, AnalysisBuilder, Failure, FailureKind, FileResult, FileStatus, Outcome,
    ProjectInfo, ProjectResult, ProjectSummary,
};
pub use error::{Result, ShadesError};
pub use formatter::{CommandFormatter, Formatter, NoopFormatter};
pub use fs::{FileSystem, StdFileSystem};
pub use invoker::{check_file, check_source, invoke};
pub use pool::{FileTask, PoolConfig, PoolReport, Progress, StopHandle, StopSignal, WorkerPool};
pub use report::{fmt_int, render_json};
