//! Per-call logging to syslog.
//!
//! A PAM module runs inside someone else's process, so it must not install a
//! global subscriber.  Each entry point wraps its work in [`scoped`], which
//! sets a `tracing` subscriber for the current thread only and forwards
//! every formatted event to syslog under `LOG_AUTHPRIV`.

use std::io;
use std::sync::{Arc, Mutex};

use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

/// Run `f` with events routed to syslog.
///
/// `debug` lowers the threshold from `INFO` to `DEBUG`.  Without a reachable
/// syslog socket events are dropped; logging never fails the call.
pub fn scoped<R>(debug: bool, f: impl FnOnce() -> R) -> R {
    let formatter = Formatter3164 {
        facility: Facility::LOG_AUTHPRIV,
        hostname: None,
        process: String::from("pam_sshmint"),
        pid: std::process::id(),
    };
    match syslog::unix(formatter) {
        Ok(logger) => scoped_with(debug, Syslog::new(logger), f),
        Err(_) => scoped_with(debug, io::sink, f),
    }
}

/// Run `f` with events formatted into `writer`.
pub fn scoped_with<W, R>(debug: bool, writer: W, f: impl FnOnce() -> R) -> R
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = if debug { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::with_default(subscriber, f)
}

type SyslogLogger = Logger<LoggerBackend, Formatter3164>;

/// Writer factory that sends each event to syslog at a matching severity.
#[derive(Clone)]
pub struct Syslog {
    logger: Arc<Mutex<SyslogLogger>>,
}

impl Syslog {
    pub fn new(logger: SyslogLogger) -> Self {
        Self {
            logger: Arc::new(Mutex::new(logger)),
        }
    }
}

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogLine;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLine::new(Arc::clone(&self.logger), Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogLine::new(Arc::clone(&self.logger), *meta.level())
    }
}

/// Buffers one formatted event and logs it when dropped.
pub struct SyslogLine {
    logger: Arc<Mutex<SyslogLogger>>,
    level: Level,
    buf: Vec<u8>,
}

impl SyslogLine {
    fn new(logger: Arc<Mutex<SyslogLogger>>, level: Level) -> Self {
        Self {
            logger,
            level,
            buf: Vec::with_capacity(256),
        }
    }
}

impl io::Write for SyslogLine {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogLine {
    fn drop(&mut self) {
        let Some(message) = syslog_message(&self.buf) else {
            return;
        };
        let Ok(mut logger) = self.logger.lock() else {
            return;
        };
        // A lost log line is not worth failing a login over.
        let _ = match self.level {
            Level::ERROR => logger.err(message),
            Level::WARN => logger.warning(message),
            Level::INFO => logger.info(message),
            _ => logger.debug(message),
        };
    }
}

/// Collapse a formatted event onto one line.
fn syslog_message(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(
        text.chars()
            .map(|c| if c == '\0' || c == '\n' { ' ' } else { c })
            .collect(),
    )
}
