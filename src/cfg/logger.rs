// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Structured JSON logging via `tracing`/`tracing-subscriber`, plus a
//! numbered-backup file rotation writer: on open and on size overflow,
//! rename `name.i -> name.(i+1)` for `i = N-1..0` (dropping the oldest)
//! before opening a fresh file.

use std::{
    fmt::Debug,
    fs,
    io::{self, Write},
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use chrono::Utc;
use fastrace::collector::{Config as FastraceConfig, ConsoleReporter};
use serde::Serialize;
use serde_json::json;
use tracing::{Event, Subscriber, span};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        self, FmtContext, FormatEvent, FormatFields,
        format::JsonFields,
        writer::{BoxMakeWriter, MakeWriter},
    },
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
};

use crate::cfg::config::LoggingConfig;

#[derive(Default, Debug)]
struct SpanFields(pub serde_json::Map<String, serde_json::Value>);

struct CaptureSpanFieldsLayer;

impl<S> Layer<S> for CaptureSpanFieldsLayer
where S: Subscriber + for<'a> LookupSpan<'a>
{
    fn on_new_span(
        &self,
        attrs: &span::Attributes<'_>,
        id: &span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut vis = JsonVisitor::default();
            attrs.record(&mut vis);
            span.extensions_mut().insert(SpanFields(vis.fields));
        }
    }

    fn on_record(
        &self,
        id: &span::Id,
        values: &span::Record<'_>,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id)
            && let Some(fields) = span.extensions_mut().get_mut::<SpanFields>()
        {
            let mut vis = JsonVisitor {
                fields: std::mem::take(&mut fields.0),
            };
            values.record(&mut vis);
            fields.0 = vis.fields;
        }
    }
}

struct JsonFormatter;

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    level: String,
    target: String,
    module_path: Option<String>,
    line: Option<u32>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl<S, N> FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let mut fields = visitor.fields;

        if let Some(scope) = ctx.event_scope() {
            let mut span_names = Vec::with_capacity(8);
            for span in scope.from_root() {
                span_names.push(span.name().to_string());
                if let Some(ext) = span.extensions().get::<SpanFields>() {
                    for (k, v) in &ext.0 {
                        fields.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }
            fields.insert("span_names".to_string(), json!(span_names));
        }

        let log_entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            module_path: event.metadata().module_path().map(str::to_string),
            line: event.metadata().line(),
            fields,
        };

        writeln!(
            writer,
            "{}",
            serde_json::to_string(&log_entry).map_err(|_| std::fmt::Error)?
        )
    }
}

#[derive(Default)]
struct JsonVisitor {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn Debug) {
        self.fields
            .insert(field.name().to_string(), json!(format!("{value:?}")));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), json!(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(field.name().to_string(), json!(value));
    }
}

/// A file writer that renames `name.i -> name.(i+1)` (dropping the oldest
/// beyond `num_backups`) both when first opened and whenever the next write
/// would overflow `max_size_bytes` (§6).
struct RotatingFileWriter {
    path: PathBuf,
    num_backups: u32,
    max_size_bytes: u64,
    file: Mutex<fs::File>,
    written: AtomicU64,
}

impl RotatingFileWriter {
    fn new(path: PathBuf, num_backups: u32, max_size_bytes: u64) -> Result<Self> {
        Self::rotate_on_disk(&path, num_backups)?;
        let file = open_fresh(&path)?;
        Ok(Self {
            path,
            num_backups,
            max_size_bytes,
            file: Mutex::new(file),
            written: AtomicU64::new(0),
        })
    }

    fn backup_path(path: &std::path::Path, i: u32) -> PathBuf {
        let mut s = path.as_os_str().to_owned();
        s.push(format!(".{i}"));
        PathBuf::from(s)
    }

    /// Shifts every existing backup up one slot, dropping whatever would
    /// land past `num_backups`, then moves the current file (if any) into
    /// slot 0.
    fn rotate_on_disk(path: &std::path::Path, num_backups: u32) -> Result<()> {
        if num_backups == 0 {
            if path.exists() {
                fs::remove_file(path).context("removing log file before rotation")?;
            }
            return Ok(());
        }

        for i in (0..num_backups).rev() {
            let from = Self::backup_path(path, i);
            if !from.exists() {
                continue;
            }
            if i + 1 >= num_backups {
                fs::remove_file(&from).context("dropping oldest log backup")?;
            } else {
                let to = Self::backup_path(path, i + 1);
                fs::rename(&from, &to).context("shifting log backup")?;
            }
        }

        if path.exists() {
            let to = Self::backup_path(path, 0);
            fs::rename(path, &to).context("moving current log to backup slot 0")?;
        }

        Ok(())
    }

    fn rotate(&self) -> io::Result<()> {
        Self::rotate_on_disk(&self.path, self.num_backups)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let fresh = open_fresh(&self.path)?;
        *self.file.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
        self.written.store(0, Ordering::SeqCst);
        Ok(())
    }
}

fn open_fresh(path: &std::path::Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

struct RotatingFileHandle<'a>(&'a RotatingFileWriter);

impl Write for RotatingFileHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.0.max_size_bytes > 0
            && self.0.written.load(Ordering::SeqCst) + buf.len() as u64 > self.0.max_size_bytes
        {
            self.0.rotate()?;
        }
        let n = self.0.file.lock().unwrap_or_else(|e| e.into_inner()).write(buf)?;
        self.0.written.fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.file.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileHandle<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingFileHandle(self)
    }
}

/// Keeps the process-wide subscriber and (for stdout/stderr) the
/// non-blocking writer thread alive.
pub struct LoggerGuard {
    _worker_guard: Option<WorkerGuard>,
}

pub fn init_logger(cfg: &LoggingConfig) -> Result<LoggerGuard> {
    let (writer, guard) = make_writer(cfg)?;

    fastrace::set_reporter(ConsoleReporter, FastraceConfig::default());
    let compat_layer = fastrace_tracing::FastraceCompatLayer::new();

    let env_filter = EnvFilter::try_new(&cfg.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level")?;

    let json_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .json()
        .event_format(JsonFormatter)
        .fmt_fields(JsonFields::default());

    let subscriber = Registry::default()
        .with(env_filter)
        .with(compat_layer)
        .with(CaptureSpanFieldsLayer)
        .with(json_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(LoggerGuard { _worker_guard: guard })
}

fn make_writer(cfg: &LoggingConfig) -> Result<(BoxMakeWriter, Option<WorkerGuard>)> {
    match &cfg.file {
        None => {
            let (w, g) = tracing_appender::non_blocking(std::io::stdout());
            Ok((BoxMakeWriter::new(w), Some(g)))
        },
        Some(path) => {
            let writer = RotatingFileWriter::new(
                path.clone(),
                cfg.num_backups,
                cfg.max_size_bytes,
            )
            .with_context(|| format!("opening log file {}", path.display()))?;
            Ok((BoxMakeWriter::new(Arc::new(writer)), None))
        },
    }
}
