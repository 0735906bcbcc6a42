use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use llm_batch::{
    ChatBatch, Config, ConvertConfig, EvalConfig, EvalOptions, Evaluator, InputFiles, RetryOn, RetryPolicy, StreamModes,
    convert, write_eval_templates, write_templates,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "llm-batch",
    version,
    author,
    about = "Bounded-concurrency batch calls to LLM endpoints, answer evaluation and file conversion",
    long_about = "Runs batches of I/O-bound jobs on a fixed-size worker pool.\n\n\
    `chat` sends one conversation to every enabled model at each configured \
    temperature, retrying failed calls with incremental backoff, and saves every \
    reply plus a ranked summary. `evaluate` scores a model's answers to a CSV of \
    questions against expected answers. `files` converts a directory of files \
    into one JSON Lines file.\n\n\
    USAGE EXAMPLES:\n  \
      # Write example input files into the current directory\n  \
      llm-batch chat --templates\n\n  \
      # Call every model with 4 concurrent requests\n  \
      llm-batch chat -c models_config.yaml -u chat_history.json -p 4\n\n  \
      # Evaluate a 10% sample of the questions in input.csv\n  \
      llm-batch evaluate -c configs.yaml -r 0.1 -p 4\n\n  \
      # Convert images and text files into data.jsonl\n  \
      llm-batch files --dir ./corpus --include png,txt"
)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat with several LLMs at the same time
    Chat(ChatArgs),
    /// Score a model's answers against expected answers
    Evaluate(EvaluateArgs),
    /// Convert selected files into one JSON Lines file
    Files(FilesArgs),
}

#[derive(Args, Debug)]
struct ChatArgs {
    /// LLM models config file
    #[arg(short = 'c', long, default_value = "./models_config.yaml", value_name = "FILE")]
    models_config: PathBuf,

    /// Chat history JSON file; must end with a user message
    #[arg(short = 'u', long, default_value = "./chat_history.json", value_name = "FILE")]
    chat_history: PathBuf,

    /// System prompt text file; skipped if missing
    #[arg(short = 's', long, default_value = "./system_prompt.txt", value_name = "FILE")]
    system_prompt: PathBuf,

    /// Folder for reply files, results and summary
    #[arg(short = 'o', long, default_value = "./result", value_name = "PATH")]
    output_folder: PathBuf,

    /// Calls per model and temperature
    #[arg(short, long, default_value_t = 3)]
    repeat: usize,

    /// Concurrent requests
    #[arg(short, long, default_value_t = 1)]
    parallel: usize,

    /// Response modes to call
    #[arg(long, value_enum, default_value = "both")]
    mode: CliMode,

    /// Remove <think> reasoning blocks from replies
    #[arg(long)]
    strip_think: bool,

    /// Retries after a failed attempt
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Backoff unit in seconds; attempt i waits (i - 1) times this
    #[arg(long, default_value_t = 2)]
    retry_delay: u64,

    /// Only retry transport errors, 5xx, 408 and 429
    #[arg(long)]
    transient_only: bool,

    /// Per-attempt timeout in seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    /// End-user identifier sent with each request
    #[arg(long, value_name = "ID")]
    user: Option<String>,

    /// Generate template input files in the current directory and exit
    #[arg(short, long)]
    templates: bool,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    /// Evaluation config file
    #[arg(short = 'c', long, default_value = "./configs.yaml", value_name = "FILE")]
    configs: PathBuf,

    /// Generate template config and input files in the current directory and exit
    #[arg(short, long)]
    templates: bool,

    /// Questions evaluated at the same time
    #[arg(short, long, default_value_t = 1)]
    parallel: usize,

    /// Share of questions to evaluate, from 0 to 1; the first is always kept
    #[arg(short = 'r', long, default_value_t = 1.0)]
    sampling_rate: f64,

    /// Sampling seed, for a repeatable subset
    #[arg(long)]
    seed: Option<u64>,

    /// Add duration and call id columns to the result
    #[arg(short, long)]
    debug: bool,

    /// Retries after a failed attempt
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Backoff unit in seconds; attempt i waits (i - 1) times this
    #[arg(long, default_value_t = 2)]
    retry_delay: u64,

    /// Per-attempt timeout in seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

#[derive(Args, Debug)]
struct FilesArgs {
    /// Directory to pick files from
    #[arg(short, long, value_name = "PATH")]
    dir: PathBuf,

    /// Comma-separated file types to include, e.g. 'jpg,png' (case insensitive, all if unset)
    #[arg(short, long, default_value = "")]
    include: String,

    /// Output JSON Lines file, or a directory to write data.jsonl into
    #[arg(short, long, default_value = ".", value_name = "PATH")]
    output: PathBuf,

    /// Concurrent file reads (defaults to the number of CPUs)
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Also write a gzip copy of the output
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
    gz: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliMode {
    Blocking,
    Streaming,
    Both,
}

impl From<CliMode> for StreamModes {
    fn from(m: CliMode) -> Self {
        match m {
            CliMode::Blocking => Self::Blocking,
            CliMode::Streaming => Self::Streaming,
            CliMode::Both => Self::Both,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_tracing(cli.verbose)?;

    match cli.command {
        Command::Chat(args) => run_chat(args).await,
        Command::Evaluate(args) => run_evaluate(args).await,
        Command::Files(args) => run_files(args).await,
    }
}

async fn run_chat(args: ChatArgs) -> anyhow::Result<()> {
    if args.templates {
        let written = write_templates(&PathBuf::from(".")).context("Failed to write template files")?;
        for path in written {
            println!("Wrote {}", path.display());
        }
        return Ok(());
    }

    let mut retry = RetryPolicy::new(args.retries, Duration::from_secs(args.retry_delay));
    if args.transient_only {
        retry = retry.with_retry_on(RetryOn::Transient);
    }

    let mut builder = Config::builder()
        .parallelism(args.parallel)
        .repeat(args.repeat)
        .output_dir(&args.output_folder)
        .stream_modes(args.mode.into())
        .strip_think(args.strip_think)
        .retry(retry)
        .request_timeout(Duration::from_secs(args.timeout));
    if let Some(user) = args.user {
        builder = builder.user(user);
    }
    let config = builder.build().context("Failed to build configuration")?;

    let inputs = InputFiles {
        models_config: args.models_config,
        chat_history: args.chat_history,
        system_prompt: args.system_prompt,
    }
    .load(&config.output_dir)
    .context("Failed to load chat inputs")?;

    let batch = ChatBatch::new(config).context("Failed to create chat batch")?;
    cancel_on_ctrl_c(batch.cancellation_token());

    let stats = batch.run(&inputs).await.context("Chat batch failed")?;
    stats.print_summary();
    Ok(())
}

async fn run_evaluate(args: EvaluateArgs) -> anyhow::Result<()> {
    if args.templates {
        let written = write_eval_templates(&PathBuf::from(".")).context("Failed to write template files")?;
        for path in written {
            println!("Wrote {}", path.display());
        }
        return Ok(());
    }

    let config = EvalConfig::load(&args.configs)
        .with_context(|| format!("Failed to load {}", args.configs.display()))?;
    let options = EvalOptions {
        parallelism: args.parallel,
        sampling_rate: args.sampling_rate,
        debug: args.debug,
        seed: args.seed,
        retry: RetryPolicy::new(args.retries, Duration::from_secs(args.retry_delay)),
        request_timeout: Duration::from_secs(args.timeout),
    };

    let evaluator = Evaluator::new(config, options).context("Failed to create evaluator")?;
    cancel_on_ctrl_c(evaluator.cancellation_token());

    let stats = evaluator.run().await.context("Evaluation failed")?;
    stats.print_summary();
    Ok(())
}

async fn run_files(args: FilesArgs) -> anyhow::Result<()> {
    let mut config = ConvertConfig::new(args.dir)
        .include(&args.include)
        .output(args.output)
        .gzip(args.gz);
    if let Some(parallel) = args.parallel {
        config = config.parallelism(parallel);
    }

    let stats = convert(&config).await.context("File conversion failed")?;
    stats.print_summary();
    Ok(())
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding jobs");
            token.cancel();
        }
    });
}

fn setup_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("llm_batch=info"),
        1 => EnvFilter::new("llm_batch=debug"),
        _ => EnvFilter::new("llm_batch=trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .init();

    Ok(())
}
