//! Answer evaluation against reference answers.
//!
//! Each row of an input CSV holds a question and its expected answer. The
//! candidate model answers the question, and a question that is a JSON
//! message array is played as a multi-turn conversation. The answer is then
//! scored: exactly when the row's standard is `=`, otherwise by an evaluator
//! model that replies with a `{"score", "reason"}` JSON verdict. Rows are
//! appended to a timestamped CSV as they finish. A row that could not be
//! scored gets score `-1`.

use crate::aggregate::{Merge, PartialAggregate, merge};
use crate::chat::{ChatClient, ChatReply, ChatRequest, Message, ResponseMode, Role, strip_think};
use crate::config::{DEFAULT_OUTPUT_DIR, TEMPLATE_SUFFIX};
use crate::error::{Error, Result};
use crate::http::{ReqwestTransport, Transport};
use crate::pool::{Completed, TaskError, WorkerPool};
use crate::retry::{InvocationFailure, Invoker, RetryPolicy};
use crate::sink::{LineSink, Record, csv_line};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default evaluation config file name.
pub const EVAL_CONFIG_FILE: &str = "configs.yaml";
/// Default input file name.
pub const EVAL_INPUT_FILE: &str = "input.csv";
/// End-user identifier sent with every evaluation call.
pub const EVALUATOR_USER: &str = "llm-evaluator";
/// Standard column value that selects exact comparison.
pub const EXACT_STANDARD: &str = "=";
/// Score of a row that could not be evaluated.
pub const UNKNOWN_SCORE: &str = "-1";

/// Evaluator prompt used when the config leaves it blank.
///
/// `{question}`, `{expectedAnswer}` and `{answer}` are substituted.
pub const DEFAULT_EVALUATOR_PROMPT: &str = r#"You are grading an answer against a reference answer.

Question:
{question}

Reference answer:
{expectedAnswer}

Answer to grade:
{answer}

Reply with JSON only, in the form {"score": "1", "reason": "..."}. The score is "1" if the answer agrees with the reference answer in meaning and "0" if it does not."#;

const OUTPUT_SUFFIX: &str = "_evaluate_result.csv";
const BACKUP_SUFFIX: &str = "_configs.yaml";

const EVAL_CONFIG_TEMPLATE: &str = r#"model:
  candidate:
    endpoint: https://api.openai.com
    api-key: sk-xxxxxxxx
    model: gpt-4o-mini
    temperature: 0.7
  evaluator:
    endpoint: https://api.openai.com
    api-key: sk-xxxxxxxx
    model: gpt-4o
    temperature: 0.0
input:
  file: ./input.csv
  columns:
    question: question
    expected-answer: expected-answer
    standard: standard
output:
  folder: ./result
prompt:
  # Blank uses the built-in prompt. Placeholders: {question} {expectedAnswer} {answer}
  evaluator: ""
"#;

const EVAL_INPUT_TEMPLATE: &str = r#"question,expected-answer,standard
What is 2 + 2? Reply with the number only.,4,=
What is the capital of France?,Paris,
"[{""role"":""user"",""content"":""My name is Ann.""},{""role"":""user"",""content"":""What is my name?""}]",Ann,
"#;

/// One model endpoint of the evaluation config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalModel {
    /// Base URL of the OpenAI-compatible service
    pub endpoint: String,
    /// Bearer token
    #[serde(rename = "api-key")]
    pub api_key: String,
    /// Remote model name
    pub model: String,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: f64,
}

/// The model under test and the model that grades it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalModels {
    /// Answers the questions
    pub candidate: EvalModel,
    /// Grades non-exact answers
    pub evaluator: EvalModel,
}

/// Input CSV column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Columns {
    /// Question column, required
    #[serde(default = "default_question_column")]
    pub question: String,
    /// Expected answer column, required
    #[serde(rename = "expected-answer", default = "default_expected_column")]
    pub expected_answer: String,
    /// Standard column, optional in the CSV
    #[serde(default = "default_standard_column")]
    pub standard: String,
}

fn default_question_column() -> String {
    "question".to_string()
}

fn default_expected_column() -> String {
    "expected-answer".to_string()
}

fn default_standard_column() -> String {
    "standard".to_string()
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            question: default_question_column(),
            expected_answer: default_expected_column(),
            standard: default_standard_column(),
        }
    }
}

/// `input` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSection {
    /// Input CSV
    #[serde(default = "default_input_file")]
    pub file: PathBuf,
    /// Column mapping
    #[serde(default)]
    pub columns: Columns,
}

fn default_input_file() -> PathBuf {
    PathBuf::from(EVAL_INPUT_FILE)
}

impl Default for InputSection {
    fn default() -> Self {
        Self {
            file: default_input_file(),
            columns: Columns::default(),
        }
    }
}

/// `output` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSection {
    /// Folder for result files; blank means `./result`
    #[serde(default)]
    pub folder: PathBuf,
}

/// `prompt` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSection {
    /// Evaluator prompt template; blank means [`DEFAULT_EVALUATOR_PROMPT`]
    #[serde(default)]
    pub evaluator: String,
}

/// Evaluation config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Candidate and evaluator models
    pub model: EvalModels,
    /// Input CSV and its columns
    #[serde(default)]
    pub input: InputSection,
    /// Result location
    #[serde(default)]
    pub output: OutputSection,
    /// Prompt templates
    #[serde(default)]
    pub prompt: PromptSection,
}

impl EvalConfig {
    /// Parses an evaluation config from YAML text.
    ///
    /// # Errors
    ///
    /// Returns a YAML error if the text does not match the expected shape.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Reads and parses an evaluation config.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml(&text)
    }

    /// Output folder, defaulted when blank.
    #[must_use]
    pub fn output_folder(&self) -> PathBuf {
        if self.output.folder.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_OUTPUT_DIR)
        } else {
            self.output.folder.clone()
        }
    }

    /// Evaluator prompt template, defaulted when blank.
    #[must_use]
    pub fn evaluator_prompt(&self) -> &str {
        if self.prompt.evaluator.trim().is_empty() {
            DEFAULT_EVALUATOR_PROMPT
        } else {
            &self.prompt.evaluator
        }
    }
}

/// Run options that do not live in the config file.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Questions evaluated at the same time
    pub parallelism: usize,
    /// Share of questions kept, in `[0, 1]`
    pub sampling_rate: f64,
    /// Add timing and call id columns
    pub debug: bool,
    /// Sampling seed; random when unset
    pub seed: Option<u64>,
    /// Retry policy of every call
    pub retry: RetryPolicy,
    /// Per-attempt timeout
    pub request_timeout: Duration,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            sampling_rate: 1.0,
            debug: false,
            seed: None,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(600),
        }
    }
}

impl EvalOptions {
    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if parallelism is 0 or the sampling
    /// rate is outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::config("parallelism must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(Error::config(format!(
                "sampling rate must be between 0 and 1, got {}",
                self.sampling_rate
            )));
        }
        Ok(())
    }
}

/// Parsed input CSV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputTable {
    /// Header row
    pub headers: Vec<String>,
    /// Data rows, padded to the header width
    pub rows: Vec<Vec<String>>,
}

impl InputTable {
    /// Parses CSV text with a header row. Rows may be shorter or longer
    /// than the header.
    ///
    /// # Errors
    ///
    /// Returns a CSV error if the text is not valid CSV.
    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let mut row: Vec<String> = record?.iter().map(str::to_string).collect();
            row.resize(headers.len().max(row.len()), String::new());
            rows.push(row);
        }
        Ok(Self { headers, rows })
    }

    /// Reads and parses an input CSV.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text)
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Rows with a non-blank question, in file order.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the question or expected answer
    /// column is missing.
    pub fn cases(&self, columns: &Columns, debug_columns: bool) -> Result<Vec<EvalCase>> {
        let question = self
            .column(&columns.question)
            .ok_or_else(|| Error::config(format!("input has no '{}' column", columns.question)))?;
        let expected = self
            .column(&columns.expected_answer)
            .ok_or_else(|| Error::config(format!("input has no '{}' column", columns.expected_answer)))?;
        let standard = self.column(&columns.standard);

        let cases = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !row[question].trim().is_empty())
            .map(|(i, row)| EvalCase {
                row: i + 1,
                record: row[..self.headers.len()].to_vec(),
                question: row[question].clone(),
                expected: row[expected].clone(),
                exact: standard.is_some_and(|s| row[s].trim() == EXACT_STANDARD),
                debug_columns,
            })
            .collect();
        Ok(cases)
    }
}

/// One question to evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalCase {
    /// Data row number, starting at 1
    pub row: usize,
    /// Input fields, copied to the output row
    pub record: Vec<String>,
    /// Question cell
    pub question: String,
    /// Expected answer cell
    pub expected: String,
    /// Compare exactly instead of asking the evaluator
    pub exact: bool,
    /// Render the timing and call id columns
    pub debug_columns: bool,
}

impl EvalCase {
    /// Aggregation key of the case's scoring standard.
    #[must_use]
    pub const fn standard(&self) -> &'static str {
        if self.exact { "exact" } else { "semantic" }
    }
}

/// Keeps each item with probability `rate`. The first item is always kept.
pub fn sample<T, R: Rng>(items: Vec<T>, rate: f64, rng: &mut R) -> Vec<T> {
    if rate >= 1.0 {
        return items;
    }
    let mut kept = Vec::new();
    for item in items {
        if kept.is_empty() || rng.random::<f64>() < rate {
            kept.push(item);
        }
    }
    kept
}

/// User turns of a question: the user messages of a JSON message array, or
/// the question itself.
#[must_use]
pub fn user_turns(question: &str) -> Vec<String> {
    if question.trim_start().starts_with('[') {
        if let Ok(messages) = serde_json::from_str::<Vec<Message>>(question) {
            let turns: Vec<String> = messages
                .into_iter()
                .filter(|m| m.role == Role::User)
                .map(|m| m.content)
                .collect();
            if !turns.is_empty() {
                return turns;
            }
        }
    }
    vec![question.to_string()]
}

/// The answer of a single turn, or the whole conversation as JSON.
#[must_use]
pub fn compose_answer(history: &[Message]) -> String {
    match history {
        [_, answer] => answer.content.clone(),
        _ => serde_json::to_string(history).unwrap_or_default(),
    }
}

/// Substitutes the placeholders of an evaluator prompt.
#[must_use]
pub fn fill_prompt(template: &str, question: &str, expected: &str, answer: &str) -> String {
    template
        .replace("{question}", question)
        .replace("{expectedAnswer}", expected)
        .replace("{answer}", answer)
}

/// Content of a ```` ```json ```` fence, or the trimmed text if there is none.
#[must_use]
pub fn clean_markdown_json(text: &str) -> &str {
    let Some(start) = text.find("```json") else {
        return text.trim();
    };
    let body = &text[start + "```json".len()..];
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Score and reason given to one answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// `1` match, `0` mismatch, `-1` unknown; evaluators may use fractions
    pub score: String,
    /// Explanation
    pub reason: String,
}

impl Verdict {
    /// Verdict of a row that could not be evaluated.
    #[must_use]
    pub fn unknown(why: impl std::fmt::Display) -> Self {
        Self {
            score: UNKNOWN_SCORE.to_string(),
            reason: format!("could not evaluate: {why}"),
        }
    }

    /// Numeric score; `None` when unknown or not a number.
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        self.score
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
    }
}

/// Compares trimmed answers.
#[must_use]
pub fn exact_verdict(answer: &str, expected: &str) -> Verdict {
    if answer.trim() == expected.trim() {
        Verdict {
            score: "1".to_string(),
            reason: "exact match".to_string(),
        }
    } else {
        Verdict {
            score: "0".to_string(),
            reason: "answer differs from the expected answer".to_string(),
        }
    }
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Reads the `{"score", "reason"}` verdict out of an evaluator reply.
///
/// Think blocks and a `json` code fence are removed first. The score may be
/// a string or a number.
#[must_use]
pub fn parse_verdict(reply: &str) -> Option<Verdict> {
    let cleaned = strip_think(reply);
    let value: serde_json::Value = serde_json::from_str(clean_markdown_json(&cleaned)).ok()?;
    let object = value.as_object()?;
    let score = object.get("score").map(json_text)?;
    let reason = object.get("reason").map(json_text).unwrap_or_default();
    Some(Verdict { score, reason })
}

/// Evaluated question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Candidate answer
    pub answer: String,
    /// Score and reason
    pub verdict: Verdict,
    /// Summed candidate call time
    pub answer_ms: u64,
    /// Evaluator call time
    pub evaluation_ms: u64,
    /// `[id] ms (status)` per call
    pub debug_info: String,
}

/// Outcome of one evaluation.
pub type EvalCompletion = Completed<EvalCase, Evaluation, Infallible>;

/// Header of the result CSV.
#[must_use]
pub fn output_header(input_headers: &[String], debug_columns: bool) -> Vec<String> {
    let mut header = input_headers.to_vec();
    header.extend(["answer", "score", "reason"].map(String::from));
    if debug_columns {
        header.extend(["answer_duration(ms)", "evaluation_duration(ms)", "debug_info"].map(String::from));
    }
    header
}

impl Record for EvalCompletion {
    fn render(&self) -> Result<Option<String>> {
        let case = &self.item;
        let mut fields = case.record.clone();
        let (answer, verdict, answer_ms, evaluation_ms, debug_info) = match &self.outcome {
            Ok(e) => (
                e.answer.clone(),
                e.verdict.clone(),
                e.answer_ms,
                e.evaluation_ms,
                e.debug_info.clone(),
            ),
            Err(err) => (String::new(), Verdict::unknown(err), 0, 0, String::new()),
        };
        fields.extend([answer, verdict.score, verdict.reason]);
        if case.debug_columns {
            fields.extend([answer_ms.to_string(), evaluation_ms.to_string(), debug_info]);
        }
        Ok(Some(csv_line(&fields)?))
    }

    fn label(&self) -> String {
        format!("row {}", self.item.row)
    }
}

/// Per-standard counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreTally {
    /// Rows evaluated
    pub cases: u64,
    /// Rows with a numeric score
    pub scored: u64,
    /// Sum of numeric scores
    pub score_sum: f64,
    /// Rows scored 1 or more
    pub matched: u64,
    /// Rows scored 0
    pub mismatched: u64,
    /// Rows that could not be evaluated
    pub unknown: u64,
    /// Summed candidate call time
    pub answer_ms: u64,
    /// Summed evaluator call time
    pub evaluation_ms: u64,
}

impl Merge for ScoreTally {
    fn merge(&mut self, other: Self) {
        self.cases += other.cases;
        self.scored += other.scored;
        self.score_sum += other.score_sum;
        self.matched += other.matched;
        self.mismatched += other.mismatched;
        self.unknown += other.unknown;
        self.answer_ms += other.answer_ms;
        self.evaluation_ms += other.evaluation_ms;
    }
}

impl ScoreTally {
    /// Counters for a single completion.
    #[must_use]
    pub fn from_completed(done: &EvalCompletion) -> Self {
        let mut tally = Self {
            cases: 1,
            ..Self::default()
        };
        let Ok(evaluation) = &done.outcome else {
            tally.unknown = 1;
            return tally;
        };
        tally.answer_ms = evaluation.answer_ms;
        tally.evaluation_ms = evaluation.evaluation_ms;
        match evaluation.verdict.value() {
            None => tally.unknown = 1,
            Some(value) => {
                tally.scored = 1;
                tally.score_sum = value;
                if value >= 1.0 {
                    tally.matched = 1;
                } else if value <= 0.0 {
                    tally.mismatched = 1;
                }
            }
        }
        tally
    }

    /// Mean numeric score, `None` if nothing was scored.
    #[must_use]
    pub fn mean_score(&self) -> Option<f64> {
        (self.scored > 0).then(|| self.score_sum / self.scored as f64)
    }

    /// Ranking order: cases descending.
    #[must_use]
    pub fn rank(a: &Self, b: &Self) -> Ordering {
        b.cases.cmp(&a.cases)
    }
}

/// One standard's row of the summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StandardSummary {
    /// `exact` or `semantic`
    pub standard: String,
    /// Counters
    #[serde(flatten)]
    pub tally: ScoreTally,
    /// Mean numeric score
    pub mean_score: Option<f64>,
}

/// Statistics of a finished evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct EvalStats {
    /// Rows with a question
    pub questions: usize,
    /// Rows kept by sampling
    pub evaluated: usize,
    /// Rows written to the result CSV
    pub rows_written: usize,
    /// All standards together
    pub total: ScoreTally,
    /// Mean numeric score over all standards
    pub mean_score: Option<f64>,
    /// Result CSV
    pub output_file: PathBuf,
    /// Copy of the config used
    pub config_backup: PathBuf,
    /// Wall time in seconds
    pub duration_secs: f64,
    /// Per-standard statistics, largest first
    pub standards: Vec<StandardSummary>,
}

impl EvalStats {
    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║               Evaluation Summary                      ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        println!(
            "║ Questions:            {:>8}                        ║",
            self.questions
        );
        println!(
            "║ Evaluated:            {:>8}                        ║",
            self.evaluated
        );
        println!(
            "║   - Matched:          {:>8}                        ║",
            self.total.matched
        );
        println!(
            "║   - Mismatched:       {:>8}                        ║",
            self.total.mismatched
        );
        println!(
            "║   - Unknown:          {:>8}                        ║",
            self.total.unknown
        );
        if let Some(mean) = self.mean_score {
            println!("║ Mean Score:           {mean:>8.3}                        ║");
        }
        println!(
            "║ Duration:             {:>8.2}s                       ║",
            self.duration_secs
        );
        println!("╠═══════════════════════════════════════════════════════╣");
        for s in &self.standards {
            println!(
                "║   {:<10} {:>5} cases {:>5} ok {:>5} bad {:>5} unknown ║",
                s.standard, s.tally.cases, s.tally.matched, s.tally.mismatched, s.tally.unknown
            );
        }
        println!("║ Output:                                               ║");
        println!("║   {}", self.output_file.display());
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

/// Result and config backup paths for a run started at `stamp`.
#[must_use]
pub fn output_paths(folder: &Path, candidate_model: &str, stamp: &str) -> (PathBuf, PathBuf) {
    let model: String = candidate_model
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect();
    let prefix = format!("{model}_{stamp}");
    (
        folder.join(format!("{prefix}{OUTPUT_SUFFIX}")),
        folder.join(format!("{prefix}{BACKUP_SUFFIX}")),
    )
}

struct EvalContext {
    client: ChatClient,
    candidate: EvalModel,
    evaluator: EvalModel,
    prompt: String,
}

impl EvalContext {
    async fn call(
        &self,
        model: &EvalModel,
        messages: Vec<Message>,
    ) -> (std::result::Result<ChatReply, InvocationFailure>, u64) {
        let started = Instant::now();
        let request = ChatRequest {
            model: model.model.clone(),
            messages,
            temperature: model.temperature,
            user: Some(EVALUATOR_USER.to_string()),
        };
        let outcome = self
            .client
            .complete(&model.endpoint, &model.api_key, &request, ResponseMode::Streaming)
            .await;
        (outcome, u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    async fn evaluate(&self, case: EvalCase) -> Evaluation {
        let mut history: Vec<Message> = Vec::new();
        let mut debug_info = String::new();
        let mut answer_ms = 0;

        for turn in user_turns(&case.question) {
            let mut messages = history.clone();
            messages.push(Message::user(turn.clone()));
            let (outcome, ms) = self.call(&self.candidate, messages).await;
            answer_ms += ms;
            match outcome {
                Ok(reply) => {
                    let _ = write!(debug_info, "[{}] {ms}ms (ok) ", reply.id.as_deref().unwrap_or("-"));
                    history.push(Message::user(turn));
                    history.push(Message::assistant(strip_think(&reply.content)));
                }
                Err(failure) => {
                    warn!("Candidate failed on row {}: {failure}", case.row);
                    let _ = write!(debug_info, "[-] {ms}ms ({failure}) ");
                }
            }
        }

        if history.is_empty() {
            return Evaluation {
                answer: String::new(),
                verdict: Verdict::unknown("the candidate gave no answer"),
                answer_ms,
                evaluation_ms: 0,
                debug_info: debug_info.trim_end().to_string(),
            };
        }

        let answer = compose_answer(&history);
        let mut evaluation_ms = 0;
        let verdict = if case.exact {
            exact_verdict(&answer, &case.expected)
        } else {
            let prompt = fill_prompt(&self.prompt, &case.question, &case.expected, &answer);
            let (outcome, ms) = self.call(&self.evaluator, vec![Message::user(prompt)]).await;
            evaluation_ms = ms;
            match outcome {
                Ok(reply) => {
                    let _ = write!(debug_info, "[{}] {ms}ms (ok) ", reply.id.as_deref().unwrap_or("-"));
                    parse_verdict(&reply.content).unwrap_or_else(|| {
                        debug!("Unparsable verdict for row {}: {}", case.row, reply.content);
                        Verdict::unknown("the evaluator reply is not a JSON verdict")
                    })
                }
                Err(failure) => {
                    warn!("Evaluator failed on row {}: {failure}", case.row);
                    let _ = write!(debug_info, "[-] {ms}ms ({failure}) ");
                    Verdict::unknown(failure)
                }
            }
        };

        Evaluation {
            answer,
            verdict,
            answer_ms,
            evaluation_ms,
            debug_info: debug_info.trim_end().to_string(),
        }
    }
}

/// Runs an evaluation.
#[derive(Debug)]
pub struct Evaluator {
    config: EvalConfig,
    options: EvalOptions,
    client: ChatClient,
    cancel: CancellationToken,
}

impl Evaluator {
    /// Creates an evaluator that sends over HTTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or the HTTP client cannot
    /// be created.
    pub fn new(config: EvalConfig, options: EvalOptions) -> Result<Self> {
        let transport = ReqwestTransport::new(options.request_timeout)?;
        Self::with_transport(config, options, Arc::new(transport))
    }

    /// Creates an evaluator on top of an arbitrary transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn with_transport(config: EvalConfig, options: EvalOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        options.validate()?;
        let cancel = CancellationToken::new();
        let invoker = Invoker::new(transport, options.retry.clone()).with_cancellation(cancel.clone());
        Ok(Self {
            config,
            options,
            client: ChatClient::new(invoker),
            cancel,
        })
    }

    /// Token that stops the run.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Evaluates the configured input file.
    ///
    /// # Errors
    ///
    /// Returns an error if the input cannot be read, required columns are
    /// missing, no question is left, or the result file fails. Questions
    /// that cannot be evaluated are written with score `-1`.
    #[instrument(skip_all, fields(input = %self.config.input.file.display()))]
    pub async fn run(&self) -> Result<EvalStats> {
        let table = InputTable::load(&self.config.input.file)?;
        self.run_table(&table).await
    }

    /// Evaluates an already parsed table.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run`].
    pub async fn run_table(&self, table: &InputTable) -> Result<EvalStats> {
        let start = Instant::now();
        let cases = table.cases(&self.config.input.columns, self.options.debug)?;
        let questions = cases.len();

        let mut rng = match self.options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let cases = sample(cases, self.options.sampling_rate, &mut rng);
        if cases.is_empty() {
            return Err(Error::no_input(&self.config.input.file));
        }
        let evaluated = cases.len();

        let folder = self.config.output_folder();
        fs::create_dir_all(&folder).map_err(|e| Error::io(&folder, e))?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let (output_file, config_backup) = output_paths(&folder, &self.config.model.candidate.model, &stamp);
        let backup = serde_yaml::to_string(&self.config)?;
        fs::write(&config_backup, backup).map_err(|e| Error::io(&config_backup, e))?;

        let mut sink = LineSink::create(&output_file).await?;
        sink.write_header(&csv_line(output_header(&table.headers, self.options.debug))?)
            .await?;

        let context = Arc::new(EvalContext {
            client: self.client.clone(),
            candidate: self.config.model.candidate.clone(),
            evaluator: self.config.model.evaluator.clone(),
            prompt: self.config.evaluator_prompt().to_string(),
        });

        info!(
            "Evaluating {evaluated} of {questions} questions with parallelism {}",
            self.options.parallelism
        );
        let run_cancel = self.cancel.child_token();
        sink.cancel_on_failure(run_cancel.clone());
        let pool = WorkerPool::new(self.options.parallelism)?.with_cancellation(run_cancel);
        let mut run = pool.run_folded(
            cases,
            move |case: EvalCase| {
                let context = Arc::clone(&context);
                async move { Ok::<_, Infallible>(context.evaluate(case).await) }
            },
            |tally: &mut PartialAggregate<String, ScoreTally>, done: &EvalCompletion| {
                tally.record(done.item.standard().to_string(), ScoreTally::from_completed(done));
            },
        );

        let drained = sink
            .drain(run.results(), |done: &EvalCompletion| match &done.outcome {
                Ok(e) => info!(
                    "✓ Row {} scored {} ({}ms answer, {}ms evaluation)",
                    done.item.row, e.verdict.score, e.answer_ms, e.evaluation_ms
                ),
                Err(TaskError::Cancelled) => warn!("✗ Row {} cancelled", done.item.row),
                Err(err) => warn!("✗ Row {} not evaluated: {err}", done.item.row),
            })
            .await;
        let partials = run.join().await?;
        let report = drained?;

        let merged = merge(partials);
        let mut total = ScoreTally::default();
        for (_, tally) in merged.iter() {
            total.merge(*tally);
        }
        let standards = merged
            .ranked_by(ScoreTally::rank)
            .into_iter()
            .map(|(standard, tally)| StandardSummary {
                standard: standard.clone(),
                tally: *tally,
                mean_score: tally.mean_score(),
            })
            .collect();

        let stats = EvalStats {
            questions,
            evaluated,
            rows_written: report.written,
            total,
            mean_score: total.mean_score(),
            output_file,
            config_backup,
            duration_secs: start.elapsed().as_secs_f64(),
            standards,
        };
        info!(
            "✓ Evaluated {} questions in {:.2}s: {} matched, {} mismatched, {} unknown",
            stats.evaluated, stats.duration_secs, total.matched, total.mismatched, total.unknown
        );
        Ok(stats)
    }
}

/// Writes example evaluation config and input files into `dir`, each with
/// a `_template` suffix.
///
/// # Errors
///
/// Returns an IO error if a file cannot be written.
pub fn write_eval_templates(dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let mut written = Vec::with_capacity(2);
    for (name, content) in [
        (EVAL_CONFIG_FILE, EVAL_CONFIG_TEMPLATE),
        (EVAL_INPUT_FILE, EVAL_INPUT_TEMPLATE),
    ] {
        let path = dir.join(format!("{name}{TEMPLATE_SUFFIX}"));
        fs::write(&path, content).map_err(|e| Error::io(&path, e))?;
        written.push(path);
    }

    info!("Wrote {} template files to {}", written.len(), dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpRequest, HttpResponse};
    use crate::retry::InvokeError;
    use assert_fs::prelude::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    const INPUT: &str = r#"question,expected-answer,standard
2+2?,A: 2+2?,=
capital?,Paris,
capital?,NOPE,
"[{""role"":""user"",""content"":""q1""},{""role"":""user"",""content"":""q2""}]",x,
fail,y,
,ignored,
"#;

    /// Candidate echoes the last user turn as `A: <turn>`, and fails on
    /// `fail`. The evaluator answers 0 when the reference is `NOPE`, else 1.
    #[derive(Default)]
    struct FakeModels {
        candidate_calls: AtomicUsize,
        evaluator_calls: AtomicUsize,
        bodies: Mutex<Vec<serde_json::Value>>,
    }

    fn sse(text: &str) -> HttpResponse {
        let chunk = serde_json::json!({"id": "fake-1", "choices": [{"delta": {"content": text}}]});
        HttpResponse::from_bytes(200, format!("data: {chunk}\n\ndata: [DONE]\n\n"))
    }

    #[async_trait]
    impl Transport for FakeModels {
        async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, InvokeError> {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            self.bodies.lock().unwrap().push(body.clone());
            let last = body["messages"].as_array().unwrap().last().unwrap()["content"]
                .as_str()
                .unwrap()
                .to_string();

            if request.url.contains("judge") {
                self.evaluator_calls.fetch_add(1, AtomicOrdering::SeqCst);
                let score = if last.contains("Reference answer:\nNOPE") { 0 } else { 1 };
                return Ok(sse(&format!(
                    "<think>compare</think>```json\n{{\"score\": {score}, \"reason\": \"checked\"}}\n```"
                )));
            }
            self.candidate_calls.fetch_add(1, AtomicOrdering::SeqCst);
            if last == "fail" {
                return Ok(HttpResponse::from_bytes(500, "down"));
            }
            Ok(sse(&format!("<think>hm</think>A: {last}")))
        }
    }

    fn config(folder: &Path, input: &Path) -> EvalConfig {
        let mut config = EvalConfig::from_yaml(EVAL_CONFIG_TEMPLATE).unwrap();
        config.model.candidate.endpoint = "http://cand.test".to_string();
        config.model.candidate.model = "cand/1".to_string();
        config.model.evaluator.endpoint = "http://judge.test".to_string();
        config.input.file = input.to_path_buf();
        config.output.folder = folder.to_path_buf();
        config
    }

    fn options(debug: bool) -> EvalOptions {
        EvalOptions {
            parallelism: 2,
            debug,
            retry: RetryPolicy::none(),
            ..EvalOptions::default()
        }
    }

    fn read_rows(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let headers = reader.headers().unwrap().iter().map(String::from).collect();
        let rows = reader
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect();
        (headers, rows)
    }

    #[test]
    fn test_config_defaults() {
        let config = EvalConfig::from_yaml(
            "model:
  candidate: {endpoint: 'http://a', api-key: k, model: m}
  evaluator: {endpoint: 'http://b', api-key: k, model: j}
",
        )
        .unwrap();
        assert_eq!(config.input.columns, Columns::default());
        assert_eq!(config.input.file, PathBuf::from(EVAL_INPUT_FILE));
        assert_eq!(config.output_folder(), PathBuf::from("./result"));
        assert_eq!(config.evaluator_prompt(), DEFAULT_EVALUATOR_PROMPT);
        assert!(config.model.candidate.temperature.abs() < f64::EPSILON);
    }

    #[test]
    fn test_options_validation() {
        assert!(EvalOptions::default().validate().is_ok());
        let zero = EvalOptions {
            parallelism: 0,
            ..EvalOptions::default()
        };
        assert!(zero.validate().unwrap_err().is_config());
        for rate in [-0.1, 1.5, f64::NAN] {
            let bad = EvalOptions {
                sampling_rate: rate,
                ..EvalOptions::default()
            };
            assert!(bad.validate().is_err(), "rate {rate} accepted");
        }
    }

    #[test]
    fn test_cases_skip_blank_questions_and_detect_exact() {
        let table = InputTable::parse(INPUT).unwrap();
        let cases = table.cases(&Columns::default(), false).unwrap();
        assert_eq!(cases.len(), 5);
        assert!(cases[0].exact);
        assert!(cases[1..].iter().all(|c| !c.exact));
        assert_eq!(cases[4].row, 5);
        assert_eq!(cases[1].record, vec!["capital?", "Paris", ""]);
    }

    #[test]
    fn test_missing_required_column_is_config_error() {
        let table = InputTable::parse("question,answer\nq,a\n").unwrap();
        assert!(table.cases(&Columns::default(), false).unwrap_err().is_config());

        // The standard column is optional.
        let table = InputTable::parse("question,expected-answer\nq,a\n").unwrap();
        let cases = table.cases(&Columns::default(), false).unwrap();
        assert!(!cases[0].exact);
    }

    #[test]
    fn test_custom_column_names() {
        let table = InputTable::parse("Q,Ref\nwhy?,because\n").unwrap();
        let columns = Columns {
            question: "Q".to_string(),
            expected_answer: "Ref".to_string(),
            standard: "S".to_string(),
        };
        let cases = table.cases(&columns, false).unwrap();
        assert_eq!(cases[0].question, "why?");
        assert_eq!(cases[0].expected, "because");
    }

    #[test]
    fn test_sampling_keeps_first() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(sample((0..10).collect(), 1.0, &mut rng).len(), 10);
        assert_eq!(sample((0..10).collect(), 0.0, &mut rng), vec![0]);

        let half = sample((0..200).collect::<Vec<u32>>(), 0.5, &mut StdRng::seed_from_u64(42));
        assert_eq!(half[0], 0);
        assert!(half.len() > 60 && half.len() < 140, "kept {}", half.len());
        assert!(half.windows(2).all(|w| w[0] < w[1]));
        let again = sample((0..200).collect::<Vec<u32>>(), 0.5, &mut StdRng::seed_from_u64(42));
        assert_eq!(half, again);
    }

    #[test]
    fn test_user_turns() {
        assert_eq!(user_turns("plain question"), vec!["plain question"]);
        let json = r#"[{"role":"system","content":"s"},{"role":"user","content":"a"},{"role":"assistant","content":"x"},{"role":"user","content":"b"}]"#;
        assert_eq!(user_turns(json), vec!["a", "b"]);
        assert_eq!(user_turns("[not json"), vec!["[not json"]);
    }

    #[test]
    fn test_compose_answer() {
        let single = vec![Message::user("q"), Message::assistant("a")];
        assert_eq!(compose_answer(&single), "a");

        let multi = vec![
            Message::user("q1"),
            Message::assistant("a1"),
            Message::user("q2"),
            Message::assistant("a2"),
        ];
        let parsed: Vec<Message> = serde_json::from_str(&compose_answer(&multi)).unwrap();
        assert_eq!(parsed, multi);
    }

    #[test]
    fn test_clean_markdown_json() {
        assert_eq!(clean_markdown_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(clean_markdown_json("Sure:\n```json\n{}\n``` done"), "{}");
        assert_eq!(clean_markdown_json("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(clean_markdown_json("```json {\"a\":2}"), "{\"a\":2}");
    }

    #[test]
    fn test_parse_verdict() {
        let verdict = parse_verdict("<think>hmm</think>\n```json\n{\"score\": \"1\", \"reason\": \"same\"}\n```").unwrap();
        assert_eq!(verdict.score, "1");
        assert_eq!(verdict.reason, "same");

        let numeric = parse_verdict("{\"score\": 0.5}").unwrap();
        assert_eq!(numeric.score, "0.5");
        assert_eq!(numeric.reason, "");

        assert_eq!(parse_verdict("I think it is right"), None);
        assert_eq!(parse_verdict("{\"reason\": \"no score\"}"), None);
    }

    #[test]
    fn test_fill_prompt_and_exact_verdict() {
        let prompt = fill_prompt(DEFAULT_EVALUATOR_PROMPT, "Q?", "ref", "ans");
        assert!(prompt.contains("Question:\nQ?"));
        assert!(prompt.contains("Reference answer:\nref"));
        assert!(prompt.contains("Answer to grade:\nans"));
        assert!(!prompt.contains("{answer}"));

        assert_eq!(exact_verdict(" 4\n", "4").score, "1");
        assert_eq!(exact_verdict("four", "4").score, "0");
        assert_eq!(Verdict::unknown("x").value(), None);
    }

    #[test]
    fn test_output_paths() {
        let (csv, backup) = output_paths(Path::new("out"), "org/model:7b", "20260101_120000");
        assert_eq!(csv, PathBuf::from("out/org_model_7b_20260101_120000_evaluate_result.csv"));
        assert_eq!(backup, PathBuf::from("out/org_model_7b_20260101_120000_configs.yaml"));
    }

    #[tokio::test]
    async fn test_evaluation_end_to_end() {
        let temp = assert_fs::TempDir::new().unwrap();
        let input = temp.child("input.csv");
        input.write_str(INPUT).unwrap();
        let service = Arc::new(FakeModels::default());
        let config = config(temp.child("result").path(), input.path());

        let evaluator = Evaluator::with_transport(config.clone(), options(false), Arc::clone(&service) as Arc<dyn Transport>)
            .unwrap();
        let stats = evaluator.run().await.unwrap();

        assert_eq!(stats.questions, 5);
        assert_eq!(stats.evaluated, 5);
        assert_eq!(stats.rows_written, 5);
        // One call per single-turn question, two for the conversation.
        assert_eq!(service.candidate_calls.load(AtomicOrdering::SeqCst), 6);
        // Neither the exact row nor the failed row reaches the evaluator.
        assert_eq!(service.evaluator_calls.load(AtomicOrdering::SeqCst), 3);
        assert!(service.bodies.lock().unwrap().iter().all(|b| b["user"] == EVALUATOR_USER));

        assert_eq!(stats.total.matched, 3);
        assert_eq!(stats.total.mismatched, 1);
        assert_eq!(stats.total.unknown, 1);
        assert_eq!(stats.standards[0].standard, "semantic");
        assert_eq!(stats.standards[0].tally.cases, 4);
        assert_eq!(stats.standards[1].standard, "exact");
        assert_eq!(stats.standards[1].tally.matched, 1);

        let name = stats.output_file.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("cand_1_") && name.ends_with("_evaluate_result.csv"));
        let backup = EvalConfig::load(&stats.config_backup).unwrap();
        assert_eq!(backup, config);

        let (headers, rows) = read_rows(&stats.output_file);
        assert_eq!(headers, vec!["question", "expected-answer", "standard", "answer", "score", "reason"]);
        assert_eq!(rows.len(), 5);
        let by_question = |q: &str, expected: &str| {
            rows.iter()
                .find(|r| r[0] == q && r[1] == expected)
                .unwrap()
                .clone()
        };

        let exact = by_question("2+2?", "A: 2+2?");
        assert_eq!(exact[3], "A: 2+2?");
        assert_eq!(exact[4], "1");
        assert_eq!(by_question("capital?", "Paris")[4], "1");
        assert_eq!(by_question("capital?", "NOPE")[4], "0");

        let failed = by_question("fail", "y");
        assert_eq!(failed[4], UNKNOWN_SCORE);
        assert!(failed[5].starts_with("could not evaluate"));

        let conversation = rows.iter().find(|r| r[0].starts_with('[')).unwrap();
        let history: Vec<Message> = serde_json::from_str(&conversation[3]).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[1], Message::assistant("A: q1"));
        assert_eq!(history[3], Message::assistant("A: q2"));
        assert_eq!(conversation[4], "1");
    }

    #[tokio::test]
    async fn test_debug_columns() {
        let temp = assert_fs::TempDir::new().unwrap();
        let service = Arc::new(FakeModels::default());
        let config = config(temp.path(), &temp.path().join("unused.csv"));
        let table = InputTable::parse("question,expected-answer\nq,A: q\n").unwrap();

        let evaluator = Evaluator::with_transport(config, options(true), service).unwrap();
        let stats = evaluator.run_table(&table).await.unwrap();

        let (headers, rows) = read_rows(&stats.output_file);
        assert_eq!(headers.len(), 2 + 6);
        assert_eq!(headers[7], "debug_info");
        assert_eq!(rows[0].len(), 8);
        assert!(rows[0][5].parse::<u64>().is_ok());
        assert_eq!(rows[0][7].matches("[fake-1]").count(), 2);
    }

    #[tokio::test]
    async fn test_nothing_to_evaluate() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = config(temp.path(), &temp.path().join("input.csv"));
        let evaluator = Evaluator::with_transport(config, options(false), Arc::new(FakeModels::default())).unwrap();

        let blank = InputTable::parse("question,expected-answer\n,a\n").unwrap();
        assert!(matches!(
            evaluator.run_table(&blank).await.unwrap_err(),
            Error::NoInput { .. }
        ));
        assert!(evaluator.run().await.unwrap_err().is_io());
    }

    #[test]
    fn test_templates_parse() {
        let temp = assert_fs::TempDir::new().unwrap();
        let written = write_eval_templates(temp.path()).unwrap();
        assert_eq!(written.len(), 2);

        let config = EvalConfig::load(temp.child("configs.yaml_template").path()).unwrap();
        assert_eq!(config.evaluator_prompt(), DEFAULT_EVALUATOR_PROMPT);
        let table = InputTable::load(temp.child("input.csv_template").path()).unwrap();
        let cases = table.cases(&config.input.columns, false).unwrap();
        assert_eq!(cases.len(), 3);
        assert_eq!(user_turns(&cases[2].question).len(), 2);
    }
}
