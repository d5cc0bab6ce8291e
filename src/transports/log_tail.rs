//! Log-tail capture backend.
//!
//! A dedicated thread reads a line-oriented device log (typically
//! `adb logcat` filtered to the browser's tag), keeps lines the endpoint
//! filter's coarse line check accepts, and pushes them onto the hand-off
//! queue. The consumer side drains the queue on each poll and pulls the
//! embedded JSON object out of every captured line.
//!
//! No correlation table is involved here: each captured line is assumed to
//! carry a complete response body.

use std::io::{self, BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use super::handoff::{HandoffReceiver, HandoffSender, handoff_queue};
use super::{CaptureError, CaptureResult, ShutdownReport, TransportFailure};
use crate::engine::core::CapturedEvent;
use crate::engine::extractors::{ExtractedRecord, ExtractionError, RecordExtractor};
use crate::engine::filters::EndpointFilter;
use crate::modules::events::{
    CaptureEvent, EventDispatcher, FailureEvent, RecordEvent, TransportEvent,
};
use crate::modules::metrics::FailureStage;

const BACKEND_NAME: &str = "log-tail";

static EMBEDDED_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap_or_else(|err| panic!("invalid payload regex: {}", err)));

static EMBEDDED_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^\s"'<>]+"#).unwrap_or_else(|err| panic!("invalid url regex: {}", err))
});

/// Outermost `{ ... }` span in a log line, if any.
pub fn embedded_payload(line: &str) -> Option<&str> {
    EMBEDDED_OBJECT.find(line).map(|m| m.as_str())
}

/// First absolute URL mentioned in a log line, if any.
pub fn embedded_url(line: &str) -> Option<&str> {
    let prefix = embedded_payload(line)
        .and_then(|payload| line.find(payload).map(|idx| &line[..idx]))
        .unwrap_or(line);
    EMBEDDED_URL.find(prefix).map(|m| m.as_str())
}

/// Command line used to stream the device log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogcatCommand {
    pub adb_path: String,
    pub serial: Option<String>,
    pub format: String,
    pub filter_specs: Vec<String>,
}

impl Default for LogcatCommand {
    fn default() -> Self {
        Self {
            adb_path: "adb".into(),
            serial: Some("emulator-5554".into()),
            format: "time".into(),
            filter_specs: vec!["chromium:V".into(), "*:S".into()],
        }
    }
}

impl LogcatCommand {
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_adb_path(mut self, path: impl Into<String>) -> Self {
        self.adb_path = path.into();
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(serial) = &self.serial {
            args.push("-s".to_string());
            args.push(serial.clone());
        }
        args.push("logcat".to_string());
        args.push("-v".to_string());
        args.push(self.format.clone());
        args.extend(self.filter_specs.iter().cloned());
        args
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.adb_path);
        command
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        command
    }
}

/// Counters reported by a tailer thread that exited cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailSummary {
    pub lines_read: u64,
    pub lines_captured: u64,
}

type TailResult = Result<TailSummary, TransportFailure>;

/// Handle to the background thread reading the log stream.
pub struct LogTailer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<TailResult>>,
    child: Option<Child>,
}

impl LogTailer {
    /// Tail any line-oriented reader on a new thread.
    pub fn spawn<R>(
        reader: R,
        filter: Arc<EndpointFilter>,
        sender: HandoffSender<CapturedEvent>,
    ) -> io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("log-tailer".into())
            .spawn(move || tail_lines(reader, &filter, &sender, &thread_stop))?;

        Ok(Self {
            stop,
            handle: Some(handle),
            child: None,
        })
    }

    /// Launch the device log command and tail its standard output.
    pub fn spawn_command(
        command: &LogcatCommand,
        filter: Arc<EndpointFilter>,
        sender: HandoffSender<CapturedEvent>,
    ) -> io::Result<Self> {
        let mut child = command.to_command().spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("log command has no stdout"))?;
        log::info!("tailing `{} {}`", command.adb_path, command.args().join(" "));

        let mut tailer = Self::spawn(BufReader::new(stdout), filter, sender)?;
        tailer.child = Some(child);
        Ok(tailer)
    }

    /// Ask the thread to stop. It notices before handling the next line;
    /// a child log process is killed so a blocked read returns at once.
    pub fn request_stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                log::debug!("log command already exited: {}", err);
            }
            let _ = child.wait();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Join a finished thread. Returns `None` while it is still running.
    pub fn try_join(&mut self) -> Option<TailResult> {
        if !self.is_finished() {
            return None;
        }
        let handle = self.handle.take()?;
        Some(handle.join().unwrap_or(Err(TransportFailure::ProducerPanicked)))
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.request_stop();
    }
}

fn tail_lines<R: BufRead>(
    mut reader: R,
    filter: &EndpointFilter,
    sender: &HandoffSender<CapturedEvent>,
    stop: &AtomicBool,
) -> TailResult {
    let mut summary = TailSummary::default();
    let mut buf = Vec::with_capacity(4096);

    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(summary);
        }

        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                if stop.load(Ordering::Acquire) {
                    return Ok(summary);
                }
                return Err(TransportFailure::StreamEnded {
                    lines: summary.lines_read,
                });
            }
            Ok(_) => {
                summary.lines_read += 1;
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if !filter.matches_line(line) {
                    continue;
                }
                if sender.push(CapturedEvent::new(line)).is_err() {
                    log::debug!("log-tail consumer dropped; tailer exiting");
                    return Ok(summary);
                }
                summary.lines_captured += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportFailure::StreamError(err.to_string())),
        }
    }
}

/// Log-tail backend: a [`LogTailer`] plus the consumer side of its queue.
pub struct LogTailBackend {
    tailer: LogTailer,
    queue: HandoffReceiver<CapturedEvent>,
    extractor: RecordExtractor,
    events: Arc<EventDispatcher>,
    exhausted: bool,
}

impl LogTailBackend {
    pub fn spawn<R>(
        reader: R,
        filter: Arc<EndpointFilter>,
        extractor: RecordExtractor,
        events: Arc<EventDispatcher>,
    ) -> CaptureResult<Self>
    where
        R: BufRead + Send + 'static,
    {
        let (sender, queue) = handoff_queue();
        let tailer = LogTailer::spawn(reader, filter, sender)?;
        Ok(Self::from_parts(tailer, queue, extractor, events))
    }

    pub fn spawn_logcat(
        command: &LogcatCommand,
        filter: Arc<EndpointFilter>,
        extractor: RecordExtractor,
        events: Arc<EventDispatcher>,
    ) -> CaptureResult<Self> {
        let (sender, queue) = handoff_queue();
        let tailer = LogTailer::spawn_command(command, filter, sender)?;
        Ok(Self::from_parts(tailer, queue, extractor, events))
    }

    pub fn from_parts(
        tailer: LogTailer,
        queue: HandoffReceiver<CapturedEvent>,
        extractor: RecordExtractor,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            tailer,
            queue,
            extractor,
            events,
            exhausted: false,
        }
    }

    /// Drain everything captured since the last poll and extract records.
    ///
    /// Bad lines are reported through the event dispatcher and skipped. Once
    /// the tailer has exited and the queue is empty, an abnormal exit is
    /// returned as [`CaptureError::TransportFailure`].
    pub fn poll(&mut self) -> CaptureResult<Vec<ExtractedRecord>> {
        let drained = self.queue.drain();
        if !drained.items.is_empty() {
            return Ok(self.extract_all(drained.items));
        }
        if drained.producers_gone && !self.exhausted {
            match self.tailer.try_join() {
                Some(Ok(summary)) => {
                    self.exhausted = true;
                    log::debug!(
                        "log tailer finished: {} lines read, {} captured",
                        summary.lines_read,
                        summary.lines_captured
                    );
                }
                Some(Err(failure)) => {
                    self.exhausted = true;
                    return Err(self.report_failure(failure));
                }
                // Sender already dropped, thread still unwinding.
                None => {}
            }
        }
        Ok(Vec::new())
    }

    /// Stop the tailer and extract whatever is still queued.
    ///
    /// A stream that ended before the stop request and was not yet surfaced
    /// by [`poll`](Self::poll) is reported alongside the records.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.tailer.request_stop();
        let joined = self.tailer.try_join();
        let pending = self.queue.drain().items;
        let records = self.extract_all(pending);
        let failure = match joined {
            Some(Err(failure)) if !self.exhausted => Some(self.report_failure(failure)),
            None if !self.tailer.is_finished() => {
                log::debug!("log tailer still blocked on read; it exits on its next line");
                None
            }
            _ => None,
        };
        ShutdownReport { records, failure }
    }

    fn extract_all(&self, captured: Vec<CapturedEvent>) -> Vec<ExtractedRecord> {
        captured
            .iter()
            .filter_map(|event| self.extract_line(event))
            .collect()
    }

    fn extract_line(&self, event: &CapturedEvent) -> Option<ExtractedRecord> {
        let result = embedded_payload(&event.line)
            .ok_or_else(|| {
                ExtractionError::MalformedPayload("no embedded JSON object in log line".into())
            })
            .and_then(|payload| {
                self.extractor
                    .extract_with_source(payload, embedded_url(&event.line))
            });

        match result {
            Ok(record) => {
                self.events.dispatch(CaptureEvent::RecordExtracted(RecordEvent {
                    source_url: record.source_url.clone(),
                    product_id: record.product_id,
                    timestamp: Utc::now(),
                }));
                Some(record)
            }
            Err(err) => {
                self.events.dispatch(CaptureEvent::Failure(FailureEvent {
                    stage: FailureStage::Extraction,
                    source: embedded_url(&event.line).unwrap_or(&event.line).to_string(),
                    error: err.to_string(),
                    timestamp: Utc::now(),
                }));
                None
            }
        }
    }

    fn report_failure(&self, failure: TransportFailure) -> CaptureError {
        self.events.dispatch(CaptureEvent::TransportFailed(TransportEvent {
            backend: BACKEND_NAME,
            error: failure.to_string(),
            timestamp: Utc::now(),
        }));
        CaptureError::TransportFailure(failure)
    }
}
