use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const TRACE_FILE_ENV: &str = "DEX_TRACE_FILE";

/// Guard that must be held alive for non-blocking writer flush on shutdown.
/// When dropped, buffered JSONL lines are flushed to disk.
#[derive(Debug)]
pub struct TracingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Split a trace file path into the directory and file name the appender
/// wants.
pub fn trace_file_parts(trace_file: &str) -> (PathBuf, String) {
    let path = PathBuf::from(trace_file);
    let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let filename = path
        .file_name()
        .map_or_else(|| "traces.jsonl".to_owned(), |f| f.to_string_lossy().into_owned());
    (dir, filename)
}

/// Initialize the layered tracing subscriber.
///
/// Layers:
/// 1. Console, filtered by `RUST_LOG` (default `info`). Off for the
///    interactive commands so logs do not interleave with replies.
/// 2. JSONL file, activated by `DEX_TRACE_FILE`, filtered at `debug`.
///
/// Returns a guard that must be held in `main()` to ensure buffered writes flush.
pub fn init(console: bool) -> TracingGuard {
    let mut guards = Vec::new();

    let console_layer = console.then(|| {
        let console_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt::layer().with_target(false).with_filter(console_filter)
    });

    let jsonl_layer = std::env::var(TRACE_FILE_ENV).ok().map(|trace_file| {
        let (dir, filename) = trace_file_parts(&trace_file);
        let file_appender = tracing_appender::rolling::never(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);

        let jsonl_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_filter(jsonl_filter)
    });

    Registry::default().with(console_layer).with(jsonl_layer).init();

    TracingGuard { _guards: guards }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_trace_path() {
        assert_eq!(
            trace_file_parts("/var/log/dex/traces.jsonl"),
            (PathBuf::from("/var/log/dex"), "traces.jsonl".to_owned())
        );
        assert_eq!(trace_file_parts("out.jsonl").1, "out.jsonl");
    }
}
