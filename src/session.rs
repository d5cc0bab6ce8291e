//! Navigation run orchestration.
//!
//! Wires a capture backend (protocol-push or log-tail) to a
//! [`NavigationDriver`] and walks a list of target pages: navigate under a
//! deadline, let the page settle, collect whatever records the backend
//! produced, reset the driver, move on.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::config::{CaptureConfig, ConfigError, duration_ms};
use crate::engine::core::NetworkEvent;
use crate::engine::extractors::{ExtractedRecord, FieldPaths};
use crate::modules::events::{EventDispatcher, EventHandler, MetricsHandler};
use crate::modules::metrics::{CaptureMetrics, MetricsSnapshot};
use crate::transports::{
	BodyFetcher, CaptureError, LogTailBackend, LogcatCommand, ProtocolPushBackend, PushSummary,
	StopHandle, TransportFailure, stop_signal,
};

/// Result alias used by the session layer.
pub type SessionResult<T> = Result<T, SessionError>;

/// Failure reported by a [`NavigationDriver`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
	message: String,
}

impl DriverError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
		}
	}
}

#[derive(Debug, Error)]
pub enum SessionError {
	#[error(transparent)]
	Capture(#[from] CaptureError),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("navigation to {url} failed: {source}")]
	Driver {
		url: String,
		#[source]
		source: DriverError,
	},
	#[error("navigation to {url} timed out after {timeout:?}")]
	NavigationTimeout { url: String, timeout: Duration },
	#[error("no tokio runtime available: {0}")]
	Runtime(#[from] tokio::runtime::TryCurrentError),
	#[error("failed to write records: {0}")]
	Io(#[from] std::io::Error),
	#[error("failed to serialise records: {0}")]
	Json(#[from] serde_json::Error),
	/// A fatal failure ended the run; the records captured before it are kept.
	#[error("run aborted with {} records kept: {source}", .records.len())]
	Aborted {
		records: Vec<ExtractedRecord>,
		#[source]
		source: Box<SessionError>,
	},
}

impl SessionError {
	/// Errors that end a run. Everything else only costs the current page.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			SessionError::Capture(_) | SessionError::Runtime(_) | SessionError::Aborted { .. }
		)
	}

	/// Records captured before a fatal failure, if any were kept.
	pub fn partial_records(&self) -> &[ExtractedRecord] {
		match self {
			SessionError::Aborted { records, .. } => records,
			_ => &[],
		}
	}

	fn aborted(records: Vec<ExtractedRecord>, failure: SessionError) -> Self {
		match failure {
			SessionError::Aborted {
				records: mut partial,
				source,
			} => {
				let mut kept = records;
				kept.append(&mut partial);
				SessionError::Aborted {
					records: kept,
					source,
				}
			}
			other => SessionError::Aborted {
				records,
				source: Box::new(other),
			},
		}
	}
}

/// Whatever causes the target application to generate traffic.
#[async_trait]
pub trait NavigationDriver: Send {
	async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;

	/// Clear cookies/cache between pages. No-op unless overridden.
	async fn reset(&mut self) -> Result<(), DriverError> {
		Ok(())
	}
}

#[async_trait]
impl<D: NavigationDriver + ?Sized> NavigationDriver for Box<D> {
	async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
		(**self).navigate(url).await
	}

	async fn reset(&mut self) -> Result<(), DriverError> {
		(**self).reset().await
	}
}

enum Capture {
	Push {
		records: mpsc::UnboundedReceiver<ExtractedRecord>,
		stop: StopHandle,
		task: Option<JoinHandle<Result<PushSummary, CaptureError>>>,
	},
	LogTail(LogTailBackend),
}

/// Records handed over by a backend, plus the failure that stopped it, if any.
type Collected = (Vec<ExtractedRecord>, Option<SessionError>);

impl Capture {
	async fn collect(&mut self) -> Collected {
		match self {
			Capture::LogTail(backend) => match backend.poll() {
				Ok(records) => (records, None),
				Err(err) => (Vec::new(), Some(err.into())),
			},
			Capture::Push { records, task, .. } => {
				let mut collected = Vec::new();
				let mut failure = None;
				loop {
					match records.try_recv() {
						Ok(record) => collected.push(record),
						Err(TryRecvError::Empty) => break,
						Err(TryRecvError::Disconnected) => {
							// The loop exited on its own; surface why.
							if let Some(handle) = task.take()
								&& let Err(err) = finish_push_task(handle).await
							{
								failure = Some(err);
							}
							break;
						}
					}
				}
				(collected, failure)
			}
		}
	}

	async fn shutdown(self) -> Collected {
		match self {
			Capture::LogTail(backend) => {
				let report = backend.shutdown();
				(report.records, report.failure.map(Into::into))
			}
			Capture::Push {
				mut records,
				stop,
				task,
			} => {
				stop.stop();
				let mut failure = None;
				if let Some(handle) = task
					&& let Err(err) = finish_push_task(handle).await
				{
					failure = Some(err);
				}
				let mut remaining = Vec::new();
				while let Ok(record) = records.try_recv() {
					remaining.push(record);
				}
				(remaining, failure)
			}
		}
	}
}

async fn finish_push_task(
	handle: JoinHandle<Result<PushSummary, CaptureError>>,
) -> SessionResult<()> {
	match handle.await {
		Ok(Ok(summary)) => {
			log::debug!(
				"protocol-push loop finished: {} events, {} records, {} discarded on shutdown",
				summary.events,
				summary.records,
				summary.discarded_on_shutdown
			);
			Ok(())
		}
		Ok(Err(err)) => Err(err.into()),
		Err(join) => {
			log::error!("protocol-push loop aborted: {}", join);
			Err(CaptureError::TransportFailure(TransportFailure::ProducerPanicked).into())
		}
	}
}

/// Fluent builder for [`ExtractionSession`].
pub struct ExtractionSessionBuilder {
	config: CaptureConfig,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl ExtractionSessionBuilder {
	pub fn new() -> Self {
		Self {
			config: CaptureConfig::default(),
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: CaptureConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_endpoint_patterns<I, S>(mut self, patterns: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.endpoint_patterns = patterns.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_max_exchanges(mut self, max: usize) -> Self {
		self.config.max_exchanges = max;
		self
	}

	pub fn with_exchange_max_age(mut self, age: Duration) -> Self {
		self.config.exchange_max_age_ms = duration_ms(age);
		self
	}

	pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
		self.config.eviction_interval_ms = duration_ms(interval);
		self
	}

	pub fn with_settle(mut self, settle: Duration, jitter: Duration) -> Self {
		self.config.settle_ms = duration_ms(settle);
		self.config.settle_jitter_ms = duration_ms(jitter);
		self
	}

	pub fn with_navigation_timeout(mut self, deadline: Duration) -> Self {
		self.config.navigation_timeout_ms = duration_ms(deadline);
		self
	}

	pub fn with_record_root(mut self, root: impl Into<String>) -> Self {
		self.config.record_root = root.into();
		self
	}

	pub fn with_field_paths(mut self, paths: FieldPaths) -> Self {
		self.config.field_paths = paths;
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	/// Start a protocol-push backend on the current Tokio runtime, fed by
	/// `events`.
	pub fn build_protocol_push<D, F>(
		self,
		driver: D,
		fetcher: F,
		events: mpsc::Receiver<NetworkEvent>,
	) -> SessionResult<ExtractionSession<D>>
	where
		D: NavigationDriver,
		F: BodyFetcher + 'static,
	{
		let runtime = tokio::runtime::Handle::try_current()?;
		let filter = Arc::new(self.config.endpoint_filter()?);
		let (dispatcher, metrics) = self.dispatcher();

		let backend = ProtocolPushBackend::new(
			fetcher,
			filter,
			self.config.record_extractor(),
			dispatcher,
		)
		.with_correlator_config(self.config.correlator_config())
		.with_sweep_interval(self.config.eviction_interval());

		let (record_tx, record_rx) = mpsc::unbounded_channel();
		let (stop, signal) = stop_signal();
		let task = runtime.spawn(backend.run(events, record_tx, signal));

		Ok(ExtractionSession::new(
			driver,
			Capture::Push {
				records: record_rx,
				stop,
				task: Some(task),
			},
			metrics,
			&self.config,
		))
	}

	/// Tail an arbitrary line stream on a dedicated thread.
	pub fn build_log_tail<D, R>(self, driver: D, reader: R) -> SessionResult<ExtractionSession<D>>
	where
		D: NavigationDriver,
		R: std::io::BufRead + Send + 'static,
	{
		let filter = Arc::new(self.config.endpoint_filter()?);
		let (dispatcher, metrics) = self.dispatcher();
		let backend =
			LogTailBackend::spawn(reader, filter, self.config.record_extractor(), dispatcher)?;
		Ok(ExtractionSession::new(
			driver,
			Capture::LogTail(backend),
			metrics,
			&self.config,
		))
	}

	/// Spawn the device log command and tail its output.
	pub fn build_logcat<D>(
		self,
		driver: D,
		command: &LogcatCommand,
	) -> SessionResult<ExtractionSession<D>>
	where
		D: NavigationDriver,
	{
		let filter = Arc::new(self.config.endpoint_filter()?);
		let (dispatcher, metrics) = self.dispatcher();
		let backend =
			LogTailBackend::spawn_logcat(command, filter, self.config.record_extractor(), dispatcher)?;
		Ok(ExtractionSession::new(
			driver,
			Capture::LogTail(backend),
			metrics,
			&self.config,
		))
	}

	fn dispatcher(&self) -> (Arc<EventDispatcher>, Option<CaptureMetrics>) {
		let mut dispatcher = EventDispatcher::with_logging();
		let metrics = if self.config.enable_metrics {
			let metrics = CaptureMetrics::new();
			dispatcher.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));
			Some(metrics)
		} else {
			None
		};
		for handler in &self.handlers {
			dispatcher.register_handler(handler.clone());
		}
		(Arc::new(dispatcher), metrics)
	}
}

impl Default for ExtractionSessionBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// A driver plus a running capture backend.
pub struct ExtractionSession<D> {
	driver: D,
	capture: Capture,
	metrics: Option<CaptureMetrics>,
	navigation_timeout: Duration,
	settle: Duration,
	settle_jitter: Duration,
}

impl<D: NavigationDriver> ExtractionSession<D> {
	fn new(driver: D, capture: Capture, metrics: Option<CaptureMetrics>, config: &CaptureConfig) -> Self {
		Self {
			driver,
			capture,
			metrics,
			navigation_timeout: config.navigation_timeout(),
			settle: config.settle_delay(),
			settle_jitter: config.settle_jitter(),
		}
	}

	pub fn builder() -> ExtractionSessionBuilder {
		ExtractionSessionBuilder::new()
	}

	/// Visit every page in order and return the records collected.
	///
	/// A failed or timed-out page is logged and skipped. A capture backend
	/// failure ends the run with [`SessionError::Aborted`], which still carries
	/// every record collected up to that point.
	pub async fn run<I, S>(&mut self, pages: I) -> SessionResult<Vec<ExtractedRecord>>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut records = Vec::new();
		for page in pages {
			let page = page.as_ref();
			match self.visit(page).await {
				Ok(found) => {
					log::info!("{} records captured from {}", found.len(), page);
					records.extend(found);
				}
				Err(err) if err.is_fatal() => return Err(SessionError::aborted(records, err)),
				Err(err) => {
					log::warn!("skipping {}: {}", page, err);
					self.reset_driver(page).await;
				}
			}
		}
		Ok(records)
	}

	/// Navigate to one page, wait for it to settle and collect its records.
	///
	/// Records drained before a backend failure come back inside
	/// [`SessionError::Aborted`].
	pub async fn visit(&mut self, page: &str) -> SessionResult<Vec<ExtractedRecord>> {
		match timeout(self.navigation_timeout, self.driver.navigate(page)).await {
			Ok(Ok(())) => {}
			Ok(Err(source)) => {
				return Err(SessionError::Driver {
					url: page.to_string(),
					source,
				});
			}
			Err(_) => {
				return Err(SessionError::NavigationTimeout {
					url: page.to_string(),
					timeout: self.navigation_timeout,
				});
			}
		}

		sleep(self.settle_delay()).await;

		let (mut records, failure) = self.capture.collect().await;
		for record in &mut records {
			if record.source_url.is_none() {
				record.source_url = Some(page.to_string());
			}
		}
		self.reset_driver(page).await;
		match failure {
			Some(failure) => Err(SessionError::aborted(records, failure)),
			None => Ok(records),
		}
	}

	pub fn metrics(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(CaptureMetrics::snapshot)
	}

	pub fn driver(&self) -> &D {
		&self.driver
	}

	/// Stop the backend and return any records it still held.
	///
	/// A backend failure not yet reported by [`run`](Self::run) comes back as
	/// [`SessionError::Aborted`] with those records.
	pub async fn shutdown(self) -> SessionResult<Vec<ExtractedRecord>> {
		match self.capture.shutdown().await {
			(records, Some(failure)) => Err(SessionError::aborted(records, failure)),
			(records, None) => Ok(records),
		}
	}

	fn settle_delay(&self) -> Duration {
		let jitter_ms = duration_ms(self.settle_jitter);
		if jitter_ms == 0 {
			return self.settle;
		}
		self.settle + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
	}

	async fn reset_driver(&mut self, page: &str) {
		if let Err(err) = self.driver.reset().await {
			log::warn!("driver reset after {} failed: {}", page, err);
		}
	}
}

/// Write records as pretty-printed UTF-8 JSON.
pub fn write_records_json(path: impl AsRef<Path>, records: &[ExtractedRecord]) -> SessionResult<()> {
	let json = serde_json::to_string_pretty(records)?;
	fs::write(path, json)?;
	Ok(())
}
