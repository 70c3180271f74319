//! Runs a formatter over one file and classifies the result.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;

use crate::diff::unified_diff;
use crate::domain::{Failure, FailureKind, FileResult, Outcome};
use crate::formatter::Formatter;
use crate::fs::FileSystem;

/// Format `source` twice and classify the outcome.
///
/// The second pass only runs when the first pass changed the text; a
/// difference between the passes is recorded as an instability with the
/// pass-to-pass diff as its log. No failure or panic escapes this function.
pub fn invoke(formatter: &dyn Formatter, source: &str, path: &Path, args: &[String]) -> Outcome {
    let first = match guarded_format(formatter, source, path, args) {
        Ok(first) => first,
        Err(failure) => return Outcome::Failed(failure),
    };
    if first == source {
        return Outcome::Unchanged;
    }

    match guarded_format(formatter, &first, path, args) {
        Ok(second) if second == first => Outcome::from_texts(source, first),
        Ok(second) => {
            let log = unified_diff(&first, &second, "first pass", "second pass");
            Outcome::Failed(
                Failure::new(
                    FailureKind::Instability,
                    "INTERNAL ERROR: formatter produced different code on the second pass",
                )
                .with_log(log),
            )
        }
        Err(failure) => {
            let mut unstable = Failure::new(
                FailureKind::Instability,
                format!("formatter failed on its own output: {}", failure.message),
            );
            unstable.traceback = failure.traceback;
            unstable.log = failure.log;
            Outcome::Failed(unstable)
        }
    }
}

/// Read one file and run [`invoke`] on it.
///
/// `relative` is the path recorded in the result; `absolute` is where the
/// source is read from. An unreadable source is recorded as a crash.
pub fn check_file(
    formatter: &dyn Formatter,
    fs: &dyn FileSystem,
    relative: &str,
    absolute: &Path,
    args: &[String],
) -> FileResult {
    let source = match fs.read_to_string(absolute) {
        Ok(source) => source,
        Err(err) => {
            return FileResult::failed(
                relative,
                String::new(),
                Failure::crash(format!("could not read source: {err}")),
            );
        }
    };
    check_source(formatter, relative, source, args)
}

/// Run [`invoke`] on an already read `source` and record the result.
pub fn check_source(
    formatter: &dyn Formatter,
    relative: &str,
    source: String,
    args: &[String],
) -> FileResult {
    let outcome = invoke(formatter, &source, Path::new(relative), args);
    FileResult::new(relative, source, outcome)
}

fn guarded_format(
    formatter: &dyn Formatter,
    source: &str,
    path: &Path,
    args: &[String],
) -> Result<String, Failure> {
    catch_unwind(AssertUnwindSafe(|| formatter.format(source, path, args))).unwrap_or_else(
        |payload| {
            Err(Failure::crash(format!(
                "formatter panicked: {}",
                panic_message(payload.as_ref())
            )))
        },
    )
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{check_file, invoke};
    use crate::ShadesError;
    use crate::domain::{Failure, FailureKind, FileStatus, Outcome};
    use crate::formatter::{Formatter, MockFormatter};
    use crate::fs::MockFileSystem;
    use std::io;
    use std::path::Path;

    fn failure_kind(outcome: &Outcome) -> Option<FailureKind> {
        match outcome {
            Outcome::Failed(failure) => Some(failure.kind),
            _ => None,
        }
    }

    #[test]
    fn unchanged_source_skips_second_pass() {
        let mut formatter = MockFormatter::new();
        formatter
            .expect_format()
            .times(1)
            .returning(|source, _, _| Ok(source.to_string()));

        let outcome = invoke(&formatter, "x = 1\n", Path::new("a.py"), &[]);
        assert_eq!(outcome, Outcome::Unchanged);
    }

    #[test]
    fn stable_change_is_reformatted() {
        let mut formatter = MockFormatter::new();
        formatter
            .expect_format()
            .times(2)
            .returning(|source, _, _| Ok(source.replace("x=1", "x = 1")));

        let outcome = invoke(&formatter, "x=1\n", Path::new("a.py"), &[]);
        assert_eq!(
            outcome,
            Outcome::Reformatted {
                formatted: "x = 1\n".to_string(),
                added: 1,
                removed: 1,
            }
        );
    }

    #[test]
    fn second_pass_difference_is_instability() {
        let mut formatter = MockFormatter::new();
        formatter
            .expect_format()
            .times(2)
            .returning(|source, _, _| Ok(format!("{source}#\n")));

        let outcome = invoke(&formatter, "x = 1\n", Path::new("a.py"), &[]);
        assert_eq!(failure_kind(&outcome), Some(FailureKind::Instability));
        let Outcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        let log = failure.log.expect("pass diff");
        assert!(log.contains("--- first pass"));
        assert!(log.contains("+#\n"));
    }

    #[test]
    fn parse_failure_passes_through() {
        let mut formatter = MockFormatter::new();
        formatter
            .expect_format()
            .returning(|_, _, _| Err(Failure::parse("Cannot parse: 1:4")));

        let outcome = invoke(&formatter, "x = (\n", Path::new("a.py"), &[]);
        assert_eq!(failure_kind(&outcome), Some(FailureKind::ParseFailure));
    }

    #[test]
    fn failure_on_second_pass_is_instability() {
        let mut formatter = MockFormatter::new();
        formatter
            .expect_format()
            .withf(|source, _, _| source == "x=1\n")
            .returning(|_, _, _| Ok("x = 1\n".to_string()));
        formatter
            .expect_format()
            .withf(|source, _, _| source == "x = 1\n")
            .returning(|_, _, _| Err(Failure::crash("boom")));

        let outcome = invoke(&formatter, "x=1\n", Path::new("a.py"), &[]);
        let Outcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Instability);
        assert!(failure.message.ends_with("boom"));
    }

    struct Exploding;

    impl Formatter for Exploding {
        fn identity(&self) -> String {
            "exploding".to_string()
        }

        fn format(&self, _: &str, _: &Path, _: &[String]) -> Result<String, Failure> {
            panic!("formatter exploded")
        }
    }

    #[test]
    fn panics_become_crashes() {
        let outcome = invoke(&Exploding, "x\n", Path::new("a.py"), &[]);
        let Outcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Crash);
        assert_eq!(failure.message, "formatter panicked: formatter exploded");
    }

    #[test]
    fn arguments_reach_the_formatter() {
        let mut formatter = MockFormatter::new();
        formatter
            .expect_format()
            .withf(|_, path, args| {
                path == Path::new("pkg/a.py")
                    && args == ["--line-length".to_string(), "100".to_string()]
            })
            .returning(|source, _, _| Ok(source.to_string()));

        let args = vec!["--line-length".to_string(), "100".to_string()];
        let outcome = invoke(&formatter, "x\n", Path::new("pkg/a.py"), &args);
        assert_eq!(outcome, Outcome::Unchanged);
    }

    #[test]
    fn check_file_reads_through_filesystem() {
        let mut fs = MockFileSystem::new();
        fs.expect_read_to_string()
            .withf(|path| path == Path::new("/checkout/pkg/a.py"))
            .returning(|_| Ok("x=1\n".to_string()));
        let mut formatter = MockFormatter::new();
        formatter
            .expect_format()
            .returning(|_, _, _| Ok("x = 1\n".to_string()));

        let result = check_file(
            &formatter,
            &fs,
            "pkg/a.py",
            Path::new("/checkout/pkg/a.py"),
            &[],
        );
        assert_eq!(result.path(), "pkg/a.py");
        assert_eq!(result.source(), "x=1\n");
        assert_eq!(result.status(), FileStatus::Reformatted);
    }

    #[test]
    fn unreadable_source_is_a_crash() {
        let mut fs = MockFileSystem::new();
        fs.expect_read_to_string()
            .returning(|_| Err(ShadesError::Io(io::Error::new(io::ErrorKind::Other, "denied"))));
        let formatter = MockFormatter::new();

        let result = check_file(&formatter, &fs, "a.py", Path::new("/x/a.py"), &[]);
        let failure = result.failure().expect("failed result");
        assert_eq!(failure.kind, FailureKind::Crash);
        assert!(failure.message.contains("denied"));
    }
}
