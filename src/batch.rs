//! Chat batch runner.
//!
//! Every enabled model is called at each of its temperatures, `repeat`
//! times, in each configured response mode. The jobs are enumerated up
//! front and pushed through a [`WorkerPool`]; completions stream into
//! `results.jsonl` as they arrive, each reply is saved to its own text file,
//! and the per-worker statistics are merged into `summary.json` at the end.

use crate::aggregate::{Merge, PartialAggregate, merge};
use crate::chat::{ChatClient, ChatReply, ChatRequest, Message, ResponseMode, strip_think};
use crate::config::{ChatInputs, Config, ModelConfig, ModelsConfig, StreamModes};
use crate::error::{Error, Result};
use crate::http::{ReqwestTransport, Transport};
use crate::pool::{Completed, TaskError, WorkerPool};
use crate::retry::{ErrorKind, InvocationFailure, Invoker};
use crate::sink::{Durable, LineSink, Record, SinkReport, write_json_atomic};
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Per-job results file inside the output directory.
pub const RESULTS_FILE: &str = "results.jsonl";
/// Aggregated statistics file inside the output directory.
pub const SUMMARY_FILE: &str = "summary.json";

/// One call to make.
#[derive(Debug, Clone)]
pub struct ChatJob {
    /// Id of the model in the models file
    pub model_id: String,
    /// Model settings
    pub model: Arc<ModelConfig>,
    /// Sampling temperature
    pub temperature: f64,
    /// Repeat index, starting at 0
    pub index: usize,
    /// Response mode
    pub mode: ResponseMode,
}

impl ChatJob {
    /// Unique name of the job, also the stem of its reply file.
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "{}_{}{}_{}",
            self.model_id,
            self.temperature,
            self.mode.file_suffix(),
            self.index
        )
    }

    /// Reply file name.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.txt", self.label())
    }
}

/// Enumerates jobs in model, temperature, repeat, mode order.
#[must_use]
pub fn enumerate_jobs(models: &ModelsConfig, repeat: usize, modes: StreamModes) -> Vec<ChatJob> {
    let mut jobs = Vec::new();
    for (id, model) in models.enabled() {
        let model = Arc::new(model.clone());
        for &temperature in &model.temperatures {
            for index in 0..repeat {
                for &mode in modes.modes() {
                    jobs.push(ChatJob {
                        model_id: id.clone(),
                        model: Arc::clone(&model),
                        temperature,
                        index,
                        mode,
                    });
                }
            }
        }
    }
    jobs
}

/// Why a job produced no saved reply.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The call failed after its retries.
    #[error(transparent)]
    Invoke(#[from] InvocationFailure),

    /// The reply could not be saved.
    #[error("failed to write '{path}': {message}")]
    Write {
        /// Reply file
        path: PathBuf,
        /// Error message
        message: String,
    },
}

/// A reply saved to disk.
#[derive(Debug, Clone)]
pub struct SavedReply {
    /// The reply, with think blocks already stripped if configured
    pub reply: ChatReply,
    /// Reply file
    pub file: PathBuf,
}

/// Outcome of one chat job.
pub type ChatCompletion = Completed<ChatJob, SavedReply, JobError>;

struct JobContext {
    client: ChatClient,
    messages: Vec<Message>,
    output_dir: PathBuf,
    strip_think: bool,
    user: Option<String>,
}

impl JobContext {
    async fn execute(&self, job: ChatJob) -> std::result::Result<SavedReply, JobError> {
        info!(
            "Calling model {} at temperature {:.2} ({}, run {})",
            job.model_id,
            job.temperature,
            job.mode,
            job.index + 1
        );
        let request = ChatRequest {
            model: job.model.model.clone(),
            messages: self.messages.clone(),
            temperature: job.temperature,
            user: self.user.clone(),
        };
        let mut reply = self
            .client
            .complete(&job.model.endpoint, &job.model.api_key, &request, job.mode)
            .await?;
        if self.strip_think {
            reply.content = strip_think(&reply.content);
        }

        let file = self.output_dir.join(job.file_name());
        let content = format!("{}\t{}ms\r\n\r\n{}", file.display(), reply.attempt_ms, reply.content);
        tokio::fs::write(&file, content)
            .await
            .map_err(|e| JobError::Write {
                path: file.clone(),
                message: e.to_string(),
            })?;

        Ok(SavedReply { reply, file })
    }
}

/// Per-model counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    /// Jobs handled
    pub calls: u64,
    /// Replies saved
    pub successes: u64,
    /// Jobs that failed or panicked
    pub failures: u64,
    /// Jobs interrupted by cancellation
    pub cancelled: u64,
    /// Summed latency of successful calls
    pub latency_ms: u64,
    /// Summed reply length in characters
    pub chars: u64,
}

impl Merge for CallStats {
    fn merge(&mut self, other: Self) {
        self.calls += other.calls;
        self.successes += other.successes;
        self.failures += other.failures;
        self.cancelled += other.cancelled;
        self.latency_ms += other.latency_ms;
        self.chars += other.chars;
    }
}

impl CallStats {
    /// Counters for a single completion.
    #[must_use]
    pub fn from_completed(done: &ChatCompletion) -> Self {
        let mut stats = Self {
            calls: 1,
            ..Self::default()
        };
        match &done.outcome {
            Ok(saved) => {
                stats.successes = 1;
                stats.latency_ms = saved.reply.latency_ms;
                stats.chars = saved.reply.content.chars().count() as u64;
            }
            Err(TaskError::Cancelled) => stats.cancelled = 1,
            Err(_) => stats.failures = 1,
        }
        stats
    }

    /// Successes over calls, 0 when nothing was called.
    #[must_use]
    pub fn success_ratio(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }

    /// Mean latency of successful calls.
    #[must_use]
    pub const fn avg_latency_ms(&self) -> u64 {
        if self.successes == 0 {
            0
        } else {
            self.latency_ms / self.successes
        }
    }

    /// Ranking order: success ratio descending, then calls descending.
    ///
    /// Ratios are compared exactly by cross-multiplication.
    #[must_use]
    pub fn rank(a: &Self, b: &Self) -> Ordering {
        let lhs = u128::from(a.successes) * u128::from(b.calls);
        let rhs = u128::from(b.successes) * u128::from(a.calls);
        rhs.cmp(&lhs).then_with(|| b.calls.cmp(&a.calls))
    }
}

#[derive(Serialize)]
struct ResultLine<'a> {
    job: String,
    model_id: &'a str,
    model: &'a str,
    temperature: f64,
    index: usize,
    mode: ResponseMode,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped_chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Record for ChatCompletion {
    fn render(&self) -> Result<Option<String>> {
        let job = &self.item;
        let mut line = ResultLine {
            job: job.label(),
            model_id: &job.model_id,
            model: &job.model.model,
            temperature: job.temperature,
            index: job.index,
            mode: job.mode,
            status: "ok",
            id: None,
            latency_ms: None,
            attempts: None,
            skipped_chunks: None,
            file: None,
            error_kind: None,
            error: None,
        };

        match &self.outcome {
            Ok(saved) => {
                line.id = saved.reply.id.as_deref();
                line.latency_ms = Some(saved.reply.latency_ms);
                line.attempts = Some(saved.reply.attempts);
                line.skipped_chunks = Some(saved.reply.skipped_chunks);
                line.file = Some(saved.file.display().to_string());
            }
            Err(e) => {
                line.status = match e {
                    TaskError::Failed(_) => "failed",
                    TaskError::Panicked(_) => "panicked",
                    TaskError::Cancelled => "cancelled",
                };
                if let TaskError::Failed(JobError::Invoke(failure)) = e {
                    line.error_kind = Some(failure.kind);
                    line.attempts = Some(failure.attempts);
                }
                line.error = Some(e.to_string());
            }
        }

        Ok(Some(serde_json::to_string(&line)?))
    }

    fn label(&self) -> String {
        self.item.label()
    }
}

/// One ranked row of the summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    /// Model id
    pub model_id: String,
    /// Raw counters
    #[serde(flatten)]
    pub stats: CallStats,
    /// Successes over calls
    pub success_ratio: f64,
    /// Mean latency of successful calls
    pub avg_latency_ms: u64,
}

/// Statistics of a finished batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    /// Jobs enumerated
    pub total_jobs: usize,
    /// Replies saved
    pub succeeded: usize,
    /// Jobs that failed or panicked
    pub failed: usize,
    /// Jobs stopped by cancellation
    pub cancelled: usize,
    /// Lines written to the results file
    pub records_written: usize,
    /// Wall time of the run in seconds
    pub duration_secs: f64,
    /// Output directory path
    pub output_directory: String,
    /// Generation timestamp
    pub generated_at: String,
    /// Per-model statistics, best first
    pub models: Vec<ModelSummary>,
}

impl BatchStats {
    fn new(
        total_jobs: usize,
        counts: &Counts,
        sink: &SinkReport,
        merged: &PartialAggregate<String, CallStats>,
        start: Instant,
        output_dir: &Path,
    ) -> Self {
        let models = merged
            .ranked_by(CallStats::rank)
            .into_iter()
            .map(|(id, stats)| ModelSummary {
                model_id: id.clone(),
                stats: *stats,
                success_ratio: stats.success_ratio(),
                avg_latency_ms: stats.avg_latency_ms(),
            })
            .collect();

        Self {
            total_jobs,
            succeeded: counts.succeeded,
            failed: counts.failed,
            cancelled: counts.cancelled,
            records_written: sink.written,
            duration_secs: start.elapsed().as_secs_f64(),
            output_directory: output_dir.display().to_string(),
            generated_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            models,
        }
    }

    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║               Chat Batch Summary                      ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        println!(
            "║ Jobs:                 {:>8}                        ║",
            self.total_jobs
        );
        println!(
            "║   - Succeeded:        {:>8}                        ║",
            self.succeeded
        );
        println!(
            "║   - Failed:           {:>8}                        ║",
            self.failed
        );
        println!(
            "║   - Cancelled:        {:>8}                        ║",
            self.cancelled
        );
        println!(
            "║ Duration:             {:>8.2}s                       ║",
            self.duration_secs
        );
        println!("╠═══════════════════════════════════════════════════════╣");
        println!("║ Model                   ok/calls   ratio  avg latency ║");
        for model in &self.models {
            println!(
                "║ {:<22} {:>4}/{:<5} {:>6.1}% {:>9}ms ║",
                model.model_id,
                model.stats.successes,
                model.stats.calls,
                model.success_ratio * 100.0,
                model.avg_latency_ms
            );
        }
        println!("║                                                       ║");
        println!("║ Output Directory:                                     ║");
        println!("║   {}", self.output_directory);
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

#[derive(Debug, Default)]
struct Counts {
    succeeded: usize,
    failed: usize,
    cancelled: usize,
}

impl Counts {
    fn observe(&mut self, done: &ChatCompletion) {
        let label = done.item.label();
        match &done.outcome {
            Ok(saved) => {
                self.succeeded += 1;
                info!(
                    "✓ {label} in {}ms, saved to {}",
                    saved.reply.latency_ms,
                    saved.file.display()
                );
            }
            Err(TaskError::Cancelled) => {
                self.cancelled += 1;
                warn!("✗ {label} cancelled");
            }
            Err(e) => {
                self.failed += 1;
                warn!("✗ {label} failed: {e}");
            }
        }
    }
}

/// Runs chat jobs against every enabled model.
#[derive(Debug)]
pub struct ChatBatch {
    config: Config,
    client: ChatClient,
    cancel: CancellationToken,
}

impl ChatBatch {
    /// Creates a runner that sends over HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be created.
    pub fn new(config: Config) -> Result<Self> {
        let transport = ReqwestTransport::new(config.request_timeout)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Creates a runner on top of an arbitrary transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let invoker = Invoker::new(transport, config.retry.clone()).with_cancellation(cancel.clone());
        Ok(Self {
            config,
            client: ChatClient::new(invoker),
            cancel,
        })
    }

    /// Token that stops the run: queued jobs are skipped, in-flight calls
    /// and backoff sleeps are interrupted.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every job and writes the results, reply files and summary.
    ///
    /// # Errors
    ///
    /// Returns an error if no job can be enumerated, the output cannot be
    /// created, or the results sink fails. Individual job failures are
    /// recorded, not raised.
    #[instrument(skip_all, fields(output_dir = %self.config.output_dir.display()))]
    pub async fn run(&self, inputs: &ChatInputs) -> Result<BatchStats> {
        let jobs = self.jobs(inputs)?;
        self.prepare_output().await?;
        let mut sink = LineSink::create(self.config.output_dir.join(RESULTS_FILE)).await?;
        self.execute(jobs, inputs, &mut sink).await
    }

    /// Like [`Self::run`], but streams the result lines into `sink`.
    ///
    /// A failing sink cancels the jobs that have not finished yet.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run`].
    pub async fn run_with_sink<W: Durable>(&self, inputs: &ChatInputs, sink: &mut LineSink<W>) -> Result<BatchStats> {
        let jobs = self.jobs(inputs)?;
        self.prepare_output().await?;
        self.execute(jobs, inputs, sink).await
    }

    fn jobs(&self, inputs: &ChatInputs) -> Result<Vec<ChatJob>> {
        let jobs = enumerate_jobs(&inputs.models, self.config.repeat, self.config.stream_modes);
        if jobs.is_empty() {
            return Err(Error::config("no enabled model has a temperature to call"));
        }
        Ok(jobs)
    }

    async fn prepare_output(&self) -> Result<()> {
        let output_dir = &self.config.output_dir;
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| Error::io(output_dir, e))
    }

    async fn execute<W: Durable>(
        &self,
        jobs: Vec<ChatJob>,
        inputs: &ChatInputs,
        sink: &mut LineSink<W>,
    ) -> Result<BatchStats> {
        let start = Instant::now();
        let output_dir = self.config.output_dir.clone();
        let total_jobs = jobs.len();

        let mut messages = Vec::with_capacity(inputs.history.len() + 1);
        if let Some(prompt) = inputs.system_prompt.as_ref().or(self.config.system_prompt.as_ref()) {
            messages.push(Message::system(prompt.clone()));
        }
        messages.extend(inputs.history.iter().cloned());

        let context = Arc::new(JobContext {
            client: self.client.clone(),
            messages,
            output_dir: output_dir.clone(),
            strip_think: self.config.strip_think,
            user: self.config.user.clone(),
        });

        info!(
            "Dispatching {total_jobs} chat jobs with parallelism {}",
            self.config.parallelism
        );
        // Child token: a sink failure stops this run without cancelling the batch.
        let run_cancel = self.cancel.child_token();
        sink.cancel_on_failure(run_cancel.clone());
        let pool = WorkerPool::new(self.config.parallelism)?.with_cancellation(run_cancel);
        let mut run = pool.run_folded(
            jobs,
            move |job: ChatJob| {
                let context = Arc::clone(&context);
                async move { context.execute(job).await }
            },
            |stats: &mut PartialAggregate<String, CallStats>, done: &ChatCompletion| {
                stats.record(done.item.model_id.clone(), CallStats::from_completed(done));
            },
        );

        let mut counts = Counts::default();
        let drained = sink.drain(run.results(), |done| counts.observe(done)).await;
        let partials = run.join().await?;
        let report = drained?;

        let merged = merge(partials);
        let stats = BatchStats::new(total_jobs, &counts, &report, &merged, start, &output_dir);
        write_json_atomic(&output_dir.join(SUMMARY_FILE), &stats)?;

        info!(
            "✓ Chat batch completed in {:.2}s: {} ok, {} failed, {} cancelled",
            stats.duration_secs, stats.succeeded, stats.failed, stats.cancelled
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpRequest, HttpResponse};
    use crate::retry::{InvokeError, RetryPolicy};
    use crate::sink::tests::FlakyWriter;
    use assert_fs::prelude::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    const MODELS: &str = "alpha:
  endpoint: http://alpha.test
  api-key: ka
  model: alpha-1
  temperatures: [0.5, 1.0]
  enabled: true
broken:
  endpoint: http://broken.test
  api-key: kb
  model: broken-1
  temperatures: [0.7]
  enabled: true
off:
  endpoint: http://off.test
  api-key: ko
  model: off-1
  temperatures: [0.1]
  enabled: false
";

    /// Answers like a chat service: blocking or streaming depending on the
    /// request, and 500 for every request to the broken endpoint.
    #[derive(Default)]
    struct FakeService {
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Transport for FakeService {
        async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, InvokeError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if request.url.contains("broken") {
                return Ok(HttpResponse::from_bytes(500, "boom"));
            }
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            if body["stream"] == true {
                Ok(HttpResponse::from_chunks(
                    200,
                    vec![
                        Bytes::from("data: {\"id\":\"s-1\",\"choices\":[{\"delta\":{\"content\":\"<think>x</think>str\"}}]}\n"),
                        Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"eamed\"}}]}\ndata: [DONE]\n"),
                    ],
                ))
            } else {
                Ok(HttpResponse::from_bytes(
                    200,
                    r#"{"id":"b-1","choices":[{"message":{"content":"blocking"}}]}"#,
                ))
            }
        }
    }

    fn inputs() -> ChatInputs {
        ChatInputs {
            models: ModelsConfig::from_yaml(MODELS).unwrap(),
            history: vec![Message::user("hello?")],
            system_prompt: Some("be brief".to_string()),
        }
    }

    fn config(out: &Path) -> Config {
        Config::builder()
            .parallelism(3)
            .repeat(2)
            .output_dir(out)
            .retry(RetryPolicy::new(1, Duration::from_millis(1)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_enumerate_jobs() {
        let models = ModelsConfig::from_yaml(MODELS).unwrap();
        let jobs = enumerate_jobs(&models, 2, StreamModes::Both);

        // alpha: 2 temps, broken: 1 temp; 2 repeats; 2 modes. off is skipped.
        assert_eq!(jobs.len(), (2 + 1) * 2 * 2);
        assert!(jobs.iter().all(|j| j.model_id != "off"));
        assert_eq!(jobs[0].label(), "alpha_0.5_0");
        assert_eq!(jobs[1].label(), "alpha_0.5_stream_0");
        assert_eq!(jobs[4].file_name(), "alpha_1_0.txt");

        let blocking_only = enumerate_jobs(&models, 1, StreamModes::Blocking);
        assert_eq!(blocking_only.len(), 3);
    }

    #[test]
    fn test_rank_orders_by_ratio_then_calls_then_key() {
        let stats = |calls, successes| CallStats {
            calls,
            successes,
            failures: calls - successes,
            ..CallStats::default()
        };
        let merged: PartialAggregate<String, CallStats> = [
            ("c".to_string(), stats(4, 2)),
            ("a".to_string(), stats(2, 1)),
            ("b".to_string(), stats(3, 3)),
            ("d".to_string(), stats(4, 2)),
            ("e".to_string(), stats(3, 0)),
        ]
        .into_iter()
        .collect();

        let order: Vec<&str> = merged
            .ranked_by(CallStats::rank)
            .into_iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(order, vec!["b", "c", "d", "a", "e"]);
    }

    #[tokio::test]
    async fn test_batch_run_end_to_end() {
        let temp = assert_fs::TempDir::new().unwrap();
        let out = temp.child("result");
        let service = Arc::new(FakeService::default());

        let mut cfg = config(out.path());
        cfg.strip_think = true;
        let batch = ChatBatch::with_transport(cfg, Arc::clone(&service) as Arc<dyn Transport>).unwrap();
        let stats = batch.run(&inputs()).await.unwrap();

        assert_eq!(stats.total_jobs, 12);
        assert_eq!(stats.succeeded, 8);
        assert_eq!(stats.failed, 4);
        assert_eq!(stats.records_written, 12);
        // 8 successful calls, broken jobs try twice each.
        assert_eq!(service.calls.load(AtomicOrdering::SeqCst), 8 + 4 * 2);

        assert_eq!(stats.models[0].model_id, "alpha");
        assert_eq!(stats.models[0].stats.successes, 8);
        assert_eq!(stats.models[1].model_id, "broken");
        assert_eq!(stats.models[1].stats.failures, 4);

        let blocking = std::fs::read_to_string(out.path().join("alpha_0.5_0.txt")).unwrap();
        assert!(blocking.ends_with("ms\r\n\r\nblocking"));
        assert!(blocking.starts_with(&out.path().join("alpha_0.5_0.txt").display().to_string()));
        let streamed = std::fs::read_to_string(out.path().join("alpha_1_stream_1.txt")).unwrap();
        assert!(streamed.ends_with("\r\n\r\nstreamed"));
        assert!(!out.child("broken_0.7_0.txt").path().exists());

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(out.path().join(RESULTS_FILE))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 12);
        let failed: Vec<&serde_json::Value> = lines.iter().filter(|l| l["status"] == "failed").collect();
        assert_eq!(failed.len(), 4);
        assert!(failed.iter().all(|l| l["error_kind"] == "status" && l["attempts"] == 2));

        let summary: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.path().join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(summary["total_jobs"], 12);
        assert_eq!(summary["models"][0]["model_id"], "alpha");
    }

    #[tokio::test]
    async fn test_nothing_to_run_is_config_error() {
        let temp = assert_fs::TempDir::new().unwrap();
        let batch =
            ChatBatch::with_transport(config(temp.path()), Arc::new(FakeService::default())).unwrap();
        let mut empty = inputs();
        empty.models = ModelsConfig::default();
        assert!(batch.run(&empty).await.unwrap_err().is_config());
    }

    #[tokio::test]
    async fn test_cancelled_batch_reports_every_job() {
        let temp = assert_fs::TempDir::new().unwrap();
        let batch =
            ChatBatch::with_transport(config(temp.path()), Arc::new(FakeService::default())).unwrap();
        batch.cancellation_token().cancel();

        let stats = batch.run(&inputs()).await.unwrap();
        assert_eq!(stats.total_jobs, 12);
        assert_eq!(stats.cancelled, 12);
        assert_eq!(stats.records_written, 12);
    }

    #[tokio::test]
    async fn test_failing_results_sink_stops_remaining_jobs() {
        let temp = assert_fs::TempDir::new().unwrap();
        let out = temp.child("result");
        let service = Arc::new(FakeService {
            delay: Some(Duration::from_millis(20)),
            ..FakeService::default()
        });
        let mut models = inputs();
        models.models.models.retain(|id, _| id == "alpha");

        let cfg = Config::builder()
            .parallelism(2)
            .repeat(4)
            .output_dir(out.path())
            .retry(RetryPolicy::none())
            .build()
            .unwrap();
        let batch = ChatBatch::with_transport(cfg, Arc::clone(&service) as Arc<dyn Transport>).unwrap();
        let mut sink = LineSink::from_writer(FlakyWriter::new(1));

        // alpha: 2 temps, 4 repeats, 2 modes
        let err = batch.run_with_sink(&models, &mut sink).await.unwrap_err();
        match err {
            Error::Sink { written, lost, .. } => {
                assert_eq!(written, 1);
                assert_eq!(lost.len(), 15);
            }
            other => panic!("expected sink error, got {other:?}"),
        }

        let calls = service.calls.load(AtomicOrdering::SeqCst);
        assert!(calls < 16, "all {calls} jobs were called after the sink failed");
        let saved = std::fs::read_dir(out.path()).unwrap().count();
        assert!(saved < 16);
        assert!(!out.child(SUMMARY_FILE).path().exists());
        // The batch token itself is left usable.
        assert!(!batch.cancellation_token().is_cancelled());
    }
}
