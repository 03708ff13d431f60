//! Tracing setup shared by the sandbox orchestrator binaries.
//!
//! Everything is driven by environment variables so the same binary can log
//! pretty output on a developer machine and JSON into a file in production:
//!
//! * `LOG_LEVEL` - default filter when `RUST_LOG` is unset (`info`)
//! * `LOG_FORMAT` - `human` or `json`
//! * `LOG_OUTPUT` - `console`, `file`, `both` or `none`
//! * `LOG_FILE_PATH` - file used by the `file`/`both` outputs, rolled daily
//! * `LOG_TAGS` - comma separated `key:value` span field filters, for example
//!   `project_id:6f1c` to follow a single project through the orchestrator

use std::{
    collections::HashMap,
    env,
    ffi::OsStr,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Directive,
    fmt::{writer::BoxMakeWriter, MakeWriter},
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

const DEFAULT_LOG_FILE: &str = "/tmp/sandbox-orchestrator.log";
const QUIET_TARGETS: &[&str] = &["tokio=warn", "hyper=warn", "sqlx=warn", "reqwest=warn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

impl LogOutput {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            "none" | "off" => LogOutput::None,
            _ => LogOutput::Console,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }
}

/// A `key:value` pair matched against the fields of the enclosing spans.
/// A value of `*` only requires the key to be present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: PathBuf,
    pub tags: Vec<Tag>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
            output: LogOutput::Console,
            file_path: PathBuf::from(DEFAULT_LOG_FILE),
            tags: Vec::new(),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: env::var("LOG_LEVEL").unwrap_or(defaults.level),
            format: env::var("LOG_FORMAT")
                .map(|s| LogFormat::parse(&s))
                .unwrap_or(defaults.format),
            output: env::var("LOG_OUTPUT")
                .map(|s| LogOutput::parse(&s))
                .unwrap_or(defaults.output),
            file_path: env::var("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
            tags: env::var("LOG_TAGS")
                .map(|s| parse_tags(&s))
                .unwrap_or_default(),
        }
    }
}

/// Parse `LOG_TAGS` syntax. Malformed entries are skipped.
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

// --- Writers ---

struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

fn build_writer(settings: &LogSettings) -> (BoxMakeWriter, Option<WorkerGuard>) {
    let file_writer = || {
        let dir = settings
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("/tmp"));
        let name = settings
            .file_path
            .file_name()
            .unwrap_or_else(|| OsStr::new("sandbox-orchestrator.log"));
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name))
    };

    match settings.output {
        LogOutput::Console => (BoxMakeWriter::new(io::stdout), None),
        LogOutput::File => {
            let (writer, guard) = file_writer();
            (BoxMakeWriter::new(writer), Some(guard))
        }
        LogOutput::Both => {
            let (writer, guard) = file_writer();
            let tee = MakeTee {
                make_a: io::stdout,
                make_b: writer,
            };
            (BoxMakeWriter::new(tee), Some(guard))
        }
        LogOutput::None => (BoxMakeWriter::new(io::sink), None),
    }
}

// --- Tag filtering ---

struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl TagFilterLayer {
    fn matches(&self, fields: &HashMap<String, String>) -> bool {
        self.filters.iter().all(|filter| {
            fields
                .get(&filter.key)
                .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
        })
    }
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(fields);
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        // With tags configured, events outside any span are dropped.
        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.matches(&all_fields)
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

/// Initializes the global tracing subscriber from environment variables.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process when file output is enabled.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

/// Initializes the global subscriber with explicit settings. Calling it when
/// a subscriber is already installed is a no-op.
pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let mut env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    for target in QUIET_TARGETS {
        if let Ok(directive) = target.parse::<Directive>() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    let (writer, guard) = build_writer(settings);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(settings.output == LogOutput::Console);
    let fmt_layer = match settings.format {
        LogFormat::Json => fmt_layer.json().boxed(),
        LogFormat::Human => fmt_layer.pretty().boxed(),
    };

    let tag_layer = TagFilterLayer {
        filters: settings.tags.clone(),
    };

    let _ = registry()
        .with(env_filter)
        .with(tag_layer)
        .with(fmt_layer)
        .try_init();

    guard
}
