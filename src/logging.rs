// ABOUTME: Tracing setup - stdout, one append-only log file per engine, and error.log
// ABOUTME: Engine files are split by the span each engine runs inside

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_subscriber::filter::{self, LevelFilter};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Span names the engines run inside.
pub const CAPTURE_SPAN: &str = "capture";
pub const APPLY_SPAN: &str = "apply";

const ENGINE_SPANS: &[&str] = &[CAPTURE_SPAN, APPLY_SPAN];

/// Install the global subscriber.
///
/// Each name in `engines` gets `<directory>/<name>.log`, receiving events
/// emitted inside that engine's span plus events outside any engine span.
/// WARN and above also go to `<directory>/error.log`.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init(engines: &[&'static str], directory: &Path, level: &str) -> Result<()> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let mut file_layers = Vec::with_capacity(engines.len() + 1);
    for engine in engines {
        let file = open_append(&directory.join(format!("{engine}.log")))?;
        file_layers.push(engine_layer(*engine, file).boxed());
    }
    let error_file = open_append(&directory.join("error.log"))?;
    file_layers.push(
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(error_file))
            .with_filter(LevelFilter::WARN)
            .boxed(),
    );

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(file_layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// Stdout-only logging for one-shot commands.
pub fn init_stdout(level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

fn engine_layer<S>(engine: &'static str, file: File) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let belongs = filter::dynamic_filter_fn(move |_meta, cx: &LayerContext<'_, S>| {
        match cx.lookup_current() {
            Some(span) => {
                let mut owner = None;
                for ancestor in span.scope() {
                    if ENGINE_SPANS.contains(&ancestor.name()) {
                        owner = Some(ancestor.name());
                        break;
                    }
                }
                owner.map_or(true, |name| name == engine)
            }
            None => true,
        }
    });
    fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(belongs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_append_creates_and_keeps_contents() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.log");
        {
            let mut file = open_append(&path).unwrap();
            writeln!(file, "first").unwrap();
        }
        {
            let mut file = open_append(&path).unwrap();
            writeln!(file, "second").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
