use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";
pub const DEFAULT_RECENT_LINES: usize = 512;

static RECENT_LOG: Lazy<RecentLog> = Lazy::new(|| RecentLog::new(DEFAULT_RECENT_LINES));

/// Process-wide ring of recently emitted log lines, fed by [`init_logger`].
pub fn recent_log() -> RecentLog {
    RECENT_LOG.clone()
}

/// Installs the global subscriber. Every formatted line also lands in the
/// recent-log ring, which keeps the last `recent_lines` lines.
pub fn init_logger(format: LogFormat, recent_lines: usize) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let recent = recent_log();
    recent.set_capacity(recent_lines);
    let writer = io::stdout.and(recent);

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// Bounded in-memory log tail.
#[derive(Debug, Clone)]
pub struct RecentLog {
    inner: Arc<Mutex<RecentInner>>,
}

#[derive(Debug)]
struct RecentInner {
    lines: VecDeque<String>,
    capacity: usize,
}

impl RecentLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RecentInner {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
            })),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity.max(1);
        while inner.lines.len() > inner.capacity {
            inner.lines.pop_front();
        }
    }

    pub fn push_line(&self, line: &str) {
        let mut inner = self.inner.lock();
        if inner.lines.len() == inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.to_string());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest first, newline separated.
    pub fn render(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for line in &inner.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Per-event writer handed out by [`RecentLog`]; splits writes into lines.
pub struct RecentLogWriter {
    log: RecentLog,
    partial: Vec<u8>,
}

impl io::Write for RecentLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.partial.extend_from_slice(buf);
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.log.push_line(text.trim_end_matches('\r'));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RecentLogWriter {
    fn drop(&mut self) {
        if !self.partial.is_empty() {
            let text = String::from_utf8_lossy(&self.partial).into_owned();
            self.log.push_line(&text);
        }
    }
}

impl<'a> MakeWriter<'a> for RecentLog {
    type Writer = RecentLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RecentLogWriter {
            log: self.clone(),
            partial: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheLogEvent {
    pub method: String,
    pub url: String,
    pub lookup: String,
    pub store: Option<String>,
    pub status: u16,
    pub bytes: u64,
    pub elapsed_ms: u128,
    pub background: bool,
}

#[derive(Debug)]
pub struct CacheLogBuilder {
    event: CacheLogEvent,
}

impl CacheLogBuilder {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            event: CacheLogEvent {
                method: method.into(),
                url: url.into(),
                lookup: String::from("bypass"),
                store: None,
                status: 0,
                bytes: 0,
                elapsed_ms: 0,
                background: false,
            },
        }
    }

    pub fn lookup(mut self, value: impl Into<String>) -> Self {
        self.event.lookup = value.into();
        self
    }

    pub fn store(mut self, value: impl Into<String>) -> Self {
        self.event.store = Some(value.into());
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.event.status = status;
        self
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        self.event.bytes = bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.event.background = background;
        self
    }

    pub fn build(self) -> CacheLogEvent {
        self.event
    }

    pub fn log(self) {
        log_cache_event(self.build());
    }
}

pub fn log_cache_event(event: CacheLogEvent) {
    let CacheLogEvent {
        method,
        url,
        lookup,
        store,
        status,
        bytes,
        elapsed_ms,
        background,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let store_field = store.as_deref();

    tracing::info!(
        target: "cache_log",
        ts,
        method,
        url,
        lookup,
        store = store_field,
        status,
        bytes,
        elapsed_ms,
        background
    );

    crate::metrics::record_request_duration(
        &lookup,
        Duration::from_millis(elapsed_ms.min(u64::MAX as u128) as u64),
    );
}
