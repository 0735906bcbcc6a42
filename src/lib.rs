//! # llm-batch
//!
//! Bounded-concurrency batch processing for I/O-bound jobs, with the tools
//! built on it: a multi-model chat caller, an answer evaluator and a files
//! to JSON Lines converter.
//!
//! ## Features
//!
//! - Retrying HTTP invoker with incremental backoff and pluggable retryability
//! - Fixed-size worker pool with a shared permit ceiling and cancellation
//! - Per-worker partial aggregates merged after the run
//! - Incremental `data: ` event stream decoding for chat completions
//! - Sequential line sink (JSON Lines or CSV) that stops the run and reports
//!   lost records on failure, with an optional gzip copy
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_batch::{ChatBatch, Config, InputFiles};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::builder()
//!     .parallelism(4)
//!     .output_dir("./result")
//!     .build()?;
//!
//! let inputs = InputFiles::default().load(&config.output_dir)?;
//! let stats = ChatBatch::new(config)?.run(&inputs).await?;
//! stats.print_summary();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! A run follows the same path whatever the job:
//! 1. **Enumerate**: work items are listed before any worker starts
//! 2. **Pool**: a fixed number of workers pull items, each call holding a permit
//! 3. **Invoke**: network jobs go through the retrying invoker, streamed bodies
//!    through the decoder
//! 4. **Sink**: completions are written in arrival order as they come in
//! 5. **Aggregate**: worker partials are merged and ranked once all are done

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod batch;
pub mod chat;
pub mod config;
pub mod convert;
mod error;
pub mod evaluate;
pub mod http;
pub mod pool;
pub mod retry;
pub mod sink;
pub mod sse;

pub use aggregate::{Merge, PartialAggregate, merge};
pub use batch::{BatchStats, CallStats, ChatBatch, ChatJob, enumerate_jobs};
pub use chat::{ChatClient, ChatReply, ChatRequest, Message, ResponseMode, Role, strip_think};
pub use config::{ChatInputs, Config, ConfigBuilder, InputFiles, ModelConfig, ModelsConfig, StreamModes, write_templates};
pub use convert::{ConvertConfig, ConvertStats, FileStats, convert};
pub use error::{Error, Result};
pub use evaluate::{EvalConfig, EvalOptions, EvalStats, Evaluator, InputTable, ScoreTally, Verdict, write_eval_templates};
pub use http::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
pub use pool::{Completed, PoolRun, TaskError, WorkerPool};
pub use retry::{ErrorKind, Invocation, InvocationFailure, InvocationResult, InvokeError, Invoker, RetryOn, RetryPolicy};
pub use sink::{Durable, LineSink, Record, SinkReport, csv_line};
pub use sse::{ChunkPolicy, Decoded, SseDecoder};
