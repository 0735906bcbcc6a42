//! Run configuration and the chat run input files.

use crate::chat::{Message, ResponseMode, Role};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_PARALLELISM: usize = 1;
const DEFAULT_REPEAT: usize = 3;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
pub(crate) const DEFAULT_OUTPUT_DIR: &str = "./result";

/// Default models file name.
pub const MODELS_CONFIG_FILE: &str = "models_config.yaml";
/// Default chat history file name.
pub const CHAT_HISTORY_FILE: &str = "chat_history.json";
/// Default system prompt file name.
pub const SYSTEM_PROMPT_FILE: &str = "system_prompt.txt";

pub(crate) const TEMPLATE_SUFFIX: &str = "_template";

const SYSTEM_PROMPT_TEMPLATE: &str = "Write the system prompt here.
It may span several lines.
It may also be left empty.
";

const CHAT_HISTORY_TEMPLATE: &str = r#"[
    {
        "role": "user",
        "content": "The user's first question."
    },
    {
        "role": "assistant",
        "content": "The answer to the previous question."
    },
    {
        "role": "user",
        "content": "The history must end with a user message: the question to ask now."
    }
]
"#;

const MODELS_CONFIG_TEMPLATE: &str = "model_1_id:
  endpoint: https://api.openai.com
  api-key: sk-xxxxxxxx
  model: gpt-4o-mini
  temperatures:
    - 0.5
    - 0.7
    - 0.9
  enabled: true
model_2_id:
  endpoint: https://api.openai.com
  api-key: sk-xxxxxxxx
  model: gpt-4o
  temperatures:
    - 0.5
    - 0.7
    - 0.9
  enabled: false
";

/// Which response modes each model is called with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamModes {
    /// Blocking only
    Blocking,
    /// Streaming only
    Streaming,
    /// Blocking, then streaming
    #[default]
    Both,
}

impl StreamModes {
    /// Modes in call order.
    #[must_use]
    pub const fn modes(self) -> &'static [ResponseMode] {
        match self {
            Self::Blocking => &[ResponseMode::Blocking],
            Self::Streaming => &[ResponseMode::Streaming],
            Self::Both => &[ResponseMode::Blocking, ResponseMode::Streaming],
        }
    }
}

/// Configuration for a chat batch run.
///
/// Use [`Config::builder()`] to construct a new configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Maximum concurrent requests
    pub parallelism: usize,

    /// Retry policy applied to every request
    pub retry: RetryPolicy,

    /// Per-attempt HTTP timeout
    pub request_timeout: Duration,

    /// Directory for results, summaries and input copies
    pub output_dir: PathBuf,

    /// Calls per model and temperature
    pub repeat: usize,

    /// Response modes to exercise
    pub stream_modes: StreamModes,

    /// Remove `<think>` blocks from replies before saving
    pub strip_think: bool,

    /// Optional system prompt prepended to every conversation
    pub system_prompt: Option<String>,

    /// End-user identifier sent with each request
    pub user: Option<String>,
}

impl Config {
    /// Creates a new configuration builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_batch::Config;
    ///
    /// let config = Config::builder()
    ///     .parallelism(4)
    ///     .repeat(1)
    ///     .build()
    ///     .expect("valid configuration");
    /// assert_eq!(config.parallelism, 4);
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Parallelism is zero
    /// - Repeat count is zero
    /// - Request timeout is zero
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::config("parallelism must be at least 1"));
        }

        if self.repeat == 0 {
            return Err(Error::config("repeat must be at least 1"));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::config("request_timeout must be greater than 0"));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            repeat: DEFAULT_REPEAT,
            stream_modes: StreamModes::default(),
            strip_think: false,
            system_prompt: None,
            user: None,
        }
    }
}

/// Builder for creating a [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    parallelism: Option<usize>,
    retry: Option<RetryPolicy>,
    request_timeout: Option<Duration>,
    output_dir: Option<PathBuf>,
    repeat: Option<usize>,
    stream_modes: Option<StreamModes>,
    strip_think: bool,
    system_prompt: Option<String>,
    user: Option<String>,
}

impl ConfigBuilder {
    /// Sets the maximum number of concurrent requests.
    #[must_use]
    pub const fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the output directory.
    #[must_use]
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Sets how many times each model and temperature is called.
    #[must_use]
    pub const fn repeat(mut self, repeat: usize) -> Self {
        self.repeat = Some(repeat);
        self
    }

    /// Sets the response modes.
    #[must_use]
    pub const fn stream_modes(mut self, modes: StreamModes) -> Self {
        self.stream_modes = Some(modes);
        self
    }

    /// Enables removal of `<think>` blocks.
    #[must_use]
    pub const fn strip_think(mut self, enabled: bool) -> Self {
        self.strip_think = enabled;
        self
    }

    /// Sets the system prompt. Blank prompts are ignored.
    #[must_use]
    pub fn system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    /// Sets the end-user identifier.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<Config> {
        let config = Config {
            parallelism: self.parallelism.unwrap_or(DEFAULT_PARALLELISM),
            retry: self.retry.unwrap_or_default(),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            output_dir: self
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            repeat: self.repeat.unwrap_or(DEFAULT_REPEAT),
            stream_modes: self.stream_modes.unwrap_or_default(),
            strip_think: self.strip_think,
            system_prompt: self.system_prompt,
            user: self.user,
        };

        config.validate()?;
        Ok(config)
    }
}

/// One model entry of the models file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of the OpenAI-compatible service
    pub endpoint: String,

    /// Bearer token
    #[serde(rename = "api-key")]
    pub api_key: String,

    /// Remote model name
    pub model: String,

    /// Temperatures to sample at
    #[serde(default)]
    pub temperatures: Vec<f64>,

    /// Entries are skipped unless enabled
    #[serde(default)]
    pub enabled: bool,
}

/// Models file: model id mapped to its settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelsConfig {
    /// Entries by id
    pub models: BTreeMap<String, ModelConfig>,
}

impl ModelsConfig {
    /// Parses a models file from YAML text.
    ///
    /// # Errors
    ///
    /// Returns a YAML error if the text does not match the expected shape.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Reads and parses a models file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml(&text)
    }

    /// Enabled entries in id order.
    pub fn enabled(&self) -> impl Iterator<Item = (&String, &ModelConfig)> {
        self.models.iter().filter(|(_, m)| m.enabled)
    }
}

/// Parses a chat history file.
///
/// # Errors
///
/// Returns an error if the JSON is malformed, the history is empty, or the
/// last message is not from the user.
pub fn parse_chat_history(text: &str) -> Result<Vec<Message>> {
    let messages: Vec<Message> = serde_json::from_str(text)?;
    match messages.last() {
        None => Err(Error::config("chat history is empty")),
        Some(last) if last.role != Role::User => Err(Error::config(
            "chat history must end with a user message",
        )),
        Some(_) => Ok(messages),
    }
}

/// Locations of the chat run inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFiles {
    /// YAML models file
    pub models_config: PathBuf,
    /// JSON chat history
    pub chat_history: PathBuf,
    /// Plain text system prompt; optional at load time
    pub system_prompt: PathBuf,
}

impl Default for InputFiles {
    fn default() -> Self {
        Self {
            models_config: PathBuf::from(MODELS_CONFIG_FILE),
            chat_history: PathBuf::from(CHAT_HISTORY_FILE),
            system_prompt: PathBuf::from(SYSTEM_PROMPT_FILE),
        }
    }
}

/// Parsed chat run inputs.
#[derive(Debug, Clone)]
pub struct ChatInputs {
    /// Models to call
    pub models: ModelsConfig,
    /// Conversation sent to every model
    pub history: Vec<Message>,
    /// System prompt, if the file exists and is not blank
    pub system_prompt: Option<String>,
}

impl InputFiles {
    /// Reads every input and stores a verbatim copy of each one that was
    /// read under `output_dir`.
    ///
    /// A missing system prompt file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the models file or chat history cannot be read or
    /// parsed, or if a copy cannot be written.
    pub fn load(&self, output_dir: &Path) -> Result<ChatInputs> {
        fs::create_dir_all(output_dir).map_err(|e| Error::io(output_dir, e))?;

        let system_prompt = match fs::read_to_string(&self.system_prompt) {
            Ok(text) => {
                copy_input(output_dir, SYSTEM_PROMPT_FILE, &text)?;
                Some(text).filter(|t| !t.trim().is_empty())
            }
            Err(e) => {
                warn!(
                    "No system prompt read from {} ({e}); requests are sent without one",
                    self.system_prompt.display()
                );
                None
            }
        };

        let history_text = fs::read_to_string(&self.chat_history)
            .map_err(|e| Error::io(&self.chat_history, e))?;
        let history = parse_chat_history(&history_text)?;
        copy_input(output_dir, CHAT_HISTORY_FILE, &history_text)?;

        let models_text = fs::read_to_string(&self.models_config)
            .map_err(|e| Error::io(&self.models_config, e))?;
        let models = ModelsConfig::from_yaml(&models_text)?;
        copy_input(output_dir, MODELS_CONFIG_FILE, &models_text)?;

        for (id, model) in models.enabled() {
            info!("Model {id} enabled, temperatures: {:?}", model.temperatures);
            if model.temperatures.is_empty() {
                warn!("Model {id} has no temperatures and will not be called");
            }
        }

        Ok(ChatInputs {
            models,
            history,
            system_prompt,
        })
    }
}

fn copy_input(output_dir: &Path, name: &str, content: &str) -> Result<()> {
    let target = output_dir.join(name);
    fs::write(&target, content).map_err(|e| Error::io(&target, e))?;
    debug!("Copied input to {}", target.display());
    Ok(())
}

/// Writes example input files into `dir`, each with a `_template` suffix.
///
/// # Errors
///
/// Returns an IO error if a file cannot be written.
pub fn write_templates(dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let templates = [
        (SYSTEM_PROMPT_FILE, SYSTEM_PROMPT_TEMPLATE),
        (CHAT_HISTORY_FILE, CHAT_HISTORY_TEMPLATE),
        (MODELS_CONFIG_FILE, MODELS_CONFIG_TEMPLATE),
    ];

    let mut written = Vec::with_capacity(templates.len());
    for (name, content) in templates {
        let path = dir.join(format!("{name}{TEMPLATE_SUFFIX}"));
        fs::write(&path, content).map_err(|e| Error::io(&path, e))?;
        written.push(path);
    }

    info!("Wrote {} template files to {}", written.len(), dir.display());
    Ok(written)
}
