//! Files to JSON Lines conversion.
//!
//! Walks a directory, keeps files whose extension is included, reads them
//! on the worker pool and writes one `{"text", "url"}` line per file. No
//! network is involved; the pool, aggregator and sink are the same ones the
//! chat batch uses. By default a gzip copy of the output is written beside
//! it.

use crate::aggregate::{Merge, PartialAggregate, merge};
use crate::error::{Error, Result};
use crate::pool::{Completed, WorkerPool};
use crate::sink::{LineSink, Record, gzip_path};
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

/// File name used when the output is a directory.
pub const DEFAULT_OUTPUT_FILE: &str = "data.jsonl";

/// Settings of a conversion run.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// Directory to walk
    pub root_dir: PathBuf,
    /// Lowercase extensions to keep; empty keeps everything
    pub include: Vec<String>,
    /// Output file, or directory to place [`DEFAULT_OUTPUT_FILE`] in
    pub output: PathBuf,
    /// Concurrent file reads
    pub parallelism: usize,
    /// Also write `{output}.gz`
    pub gzip: bool,
}

impl ConvertConfig {
    /// Converts everything under `root_dir` into `./data.jsonl`.
    #[must_use]
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            include: Vec::new(),
            output: PathBuf::from("."),
            parallelism: num_cpus::get(),
            gzip: true,
        }
    }

    /// Keeps only the extensions in a comma-separated list such as `"jpg,png"`.
    #[must_use]
    pub fn include(mut self, list: &str) -> Self {
        self.include = parse_include(list);
        self
    }

    /// Sets the output file or directory.
    #[must_use]
    pub fn output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }

    /// Sets the number of concurrent reads.
    #[must_use]
    pub const fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Enables or disables the gzip copy.
    #[must_use]
    pub const fn gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the root is not a directory or parallelism is 0.
    pub fn validate(&self) -> Result<()> {
        if !self.root_dir.is_dir() {
            return Err(Error::config(format!(
                "Root path is not a directory: {}",
                self.root_dir.display()
            )));
        }
        if self.parallelism == 0 {
            return Err(Error::config("parallelism must be at least 1"));
        }
        Ok(())
    }

    fn accepts(&self, extension: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|e| e == extension)
    }
}

/// Splits a comma-separated extension list, dropping blanks and leading dots.
#[must_use]
pub fn parse_include(list: &str) -> Vec<String> {
    list.split(',')
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

/// Lowercase extension of `path`, empty if it has none.
#[must_use]
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Resolves the output target: a directory (existing, `.`, or written with
/// a trailing separator) gets [`DEFAULT_OUTPUT_FILE`] inside it.
#[must_use]
pub fn resolve_output(output: &Path) -> PathBuf {
    let text = output.as_os_str().to_string_lossy();
    let names_dir = text == "." || text.ends_with(std::path::MAIN_SEPARATOR) || text.ends_with('/');
    if names_dir || output.is_dir() {
        output.join(DEFAULT_OUTPUT_FILE)
    } else {
        output.to_path_buf()
    }
}

/// Lists included files under the root in file name order. Hidden files
/// and the paths in `exclude` are skipped.
///
/// # Errors
///
/// Returns an IO error if the root cannot be read.
pub fn enumerate_files(config: &ConvertConfig, exclude: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let exclude: Vec<PathBuf> = exclude.iter().filter_map(|p| p.canonicalize().ok()).collect();
    let mut files = Vec::new();

    for entry in WalkDir::new(&config.root_dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                let message = e.to_string();
                return Err(Error::io(
                    &config.root_dir,
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other(message)),
                ));
            }
            Err(e) => {
                warn!("Walk error: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        if !exclude.is_empty() && path.canonicalize().is_ok_and(|p| exclude.contains(&p)) {
            continue;
        }
        let extension = extension_of(path);
        if config.accepts(&extension) {
            files.push(path.to_path_buf());
        } else {
            trace!("Excluding {} ([{extension}] not included)", path.display());
        }
    }

    debug!("Found {} files under {}", files.len(), config.root_dir.display());
    Ok(files)
}

/// One output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// File content, invalid UTF-8 replaced
    pub text: String,
    /// Path the content was read from
    pub url: String,
    /// Size of the file on disk
    #[serde(skip)]
    pub bytes: u64,
}

/// Outcome of reading one file.
pub type FileCompletion = Completed<PathBuf, FileRecord, Error>;

impl Record for FileCompletion {
    fn render(&self) -> Result<Option<String>> {
        match &self.outcome {
            Ok(record) => Ok(Some(serde_json::to_string(record)?)),
            Err(_) => Ok(None),
        }
    }

    fn label(&self) -> String {
        self.item.display().to_string()
    }
}

/// Per-extension counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileStats {
    /// Files converted
    pub files: u64,
    /// Bytes read
    pub bytes: u64,
}

impl Merge for FileStats {
    fn merge(&mut self, other: Self) {
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

impl FileStats {
    /// Ranking order: bytes descending, then files descending.
    #[must_use]
    pub fn rank(a: &Self, b: &Self) -> Ordering {
        b.bytes.cmp(&a.bytes).then_with(|| b.files.cmp(&a.files))
    }
}

/// One ranked row of the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionSummary {
    /// Lowercase extension, empty for none
    pub extension: String,
    /// Counters
    #[serde(flatten)]
    pub stats: FileStats,
}

/// Statistics of a finished conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConvertStats {
    /// Files selected
    pub files_found: usize,
    /// Lines written
    pub converted: usize,
    /// Files that could not be read
    pub failed: usize,
    /// Total bytes read
    pub bytes: u64,
    /// Output file
    pub output: PathBuf,
    /// Compressed copy of the output, if written
    pub gzip_output: Option<PathBuf>,
    /// Wall time in seconds
    pub duration_secs: f64,
    /// Per-extension statistics, largest first
    pub extensions: Vec<ExtensionSummary>,
}

impl ConvertStats {
    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║            Files to JSONL Summary                     ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        println!(
            "║ Files Found:          {:>8}                        ║",
            self.files_found
        );
        println!(
            "║   - Converted:        {:>8}                        ║",
            self.converted
        );
        println!(
            "║   - Failed:           {:>8}                        ║",
            self.failed
        );
        println!(
            "║ Bytes Read:           {:>12}                    ║",
            self.bytes
        );
        println!(
            "║ Duration:             {:>8.2}s                       ║",
            self.duration_secs
        );
        println!("╠═══════════════════════════════════════════════════════╣");
        for ext in &self.extensions {
            let name = if ext.extension.is_empty() { "(none)" } else { &ext.extension };
            println!(
                "║   {:<14} {:>8} files {:>14} bytes    ║",
                name, ext.stats.files, ext.stats.bytes
            );
        }
        println!("║ Output:                                               ║");
        println!("║   {}", self.output.display());
        if let Some(gz) = &self.gzip_output {
            println!("║   {}", gz.display());
        }
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

async fn read_file(path: PathBuf) -> Result<FileRecord> {
    let bytes = tokio::fs::read(&path).await.map_err(|e| Error::io(&path, e))?;
    Ok(FileRecord {
        text: String::from_utf8_lossy(&bytes).into_owned(),
        url: path.display().to_string(),
        bytes: bytes.len() as u64,
    })
}

/// Converts the selected files into one JSON Lines file.
///
/// Unreadable files are logged and left out of the output.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, no file is selected,
/// or the output cannot be written.
#[instrument(skip_all, fields(root_dir = %config.root_dir.display()))]
pub async fn convert(config: &ConvertConfig) -> Result<ConvertStats> {
    let start = Instant::now();
    config.validate()?;

    let output = resolve_output(&config.output);
    let files = enumerate_files(config, &[output.clone(), gzip_path(&output)])?;
    if files.is_empty() {
        return Err(Error::no_input(&config.root_dir));
    }
    let files_found = files.len();
    info!(
        "Converting {files_found} files with parallelism {}",
        config.parallelism
    );

    let mut sink = LineSink::create(&output).await?;
    if config.gzip {
        sink = sink.with_gzip_copy()?;
    }
    let gzip_output = sink.gzip_copy_path().map(Path::to_path_buf);
    let cancel = CancellationToken::new();
    sink.cancel_on_failure(cancel.clone());
    let pool = WorkerPool::new(config.parallelism)?.with_cancellation(cancel);
    let mut run = pool.run_folded(files, read_file, |stats: &mut PartialAggregate<String, FileStats>, done: &FileCompletion| {
        if let Ok(record) = &done.outcome {
            stats.record(
                extension_of(&done.item),
                FileStats {
                    files: 1,
                    bytes: record.bytes,
                },
            );
        }
    });

    let drained = sink
        .drain(run.results(), |done: &FileCompletion| match &done.outcome {
            Ok(_) => debug!("Converted {}", done.item.display()),
            Err(e) => warn!("Skipping {}: {e}", done.item.display()),
        })
        .await;
    let partials = run.join().await?;
    let report = drained?;

    let merged = merge(partials);
    let extensions: Vec<ExtensionSummary> = merged
        .ranked_by(FileStats::rank)
        .into_iter()
        .map(|(extension, stats)| ExtensionSummary {
            extension: extension.clone(),
            stats: *stats,
        })
        .collect();

    let stats = ConvertStats {
        files_found,
        converted: report.written,
        failed: report.skipped,
        bytes: extensions.iter().map(|e| e.stats.bytes).sum(),
        output,
        gzip_output,
        duration_secs: start.elapsed().as_secs_f64(),
        extensions,
    };
    info!(
        "✓ Wrote {} lines to {} in {:.2}s",
        stats.converted,
        stats.output.display(),
        stats.duration_secs
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    fn fixture() -> assert_fs::TempDir {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("src/a.rs").write_str("fn main() {}\n").unwrap();
        temp.child("src/quote.RS").write_str("let s = \"tab\\there\";").unwrap();
        temp.child("notes.md").write_str("# Notes").unwrap();
        temp.child("img/logo.png").write_binary(&[0x89, b'P', b'N', b'G', 0xff]).unwrap();
        temp.child(".hidden.rs").write_str("secret").unwrap();
        temp.child("Makefile").write_str("all:").unwrap();
        temp
    }

    #[test]
    fn test_parse_include() {
        assert_eq!(parse_include("jpg, PNG,,.md "), vec!["jpg", "png", "md"]);
        assert!(parse_include("").is_empty());
    }

    #[test]
    fn test_extension_filter_is_exact() {
        let temp = fixture();
        // "r" must not match "rs" the way a substring test would.
        let config = ConvertConfig::new(temp.path()).include("r,md");
        let files = enumerate_files(&config, &[]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["notes.md"]);
    }

    #[test]
    fn test_enumerate_is_case_insensitive_and_skips_hidden() {
        let temp = fixture();
        let config = ConvertConfig::new(temp.path()).include("rs");
        let files = enumerate_files(&config, &[]).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| !p.to_string_lossy().contains(".hidden")));

        let all = enumerate_files(&ConvertConfig::new(temp.path()), &[]).unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_resolve_output() {
        let temp = assert_fs::TempDir::new().unwrap();
        assert_eq!(resolve_output(Path::new(".")), Path::new(".").join(DEFAULT_OUTPUT_FILE));
        assert_eq!(resolve_output(temp.path()), temp.path().join(DEFAULT_OUTPUT_FILE));
        assert_eq!(resolve_output(Path::new("out/")), Path::new("out/").join(DEFAULT_OUTPUT_FILE));
        let file = temp.path().join("files.jsonl");
        assert_eq!(resolve_output(&file), file);
    }

    #[test]
    fn test_missing_root_is_rejected() {
        let config = ConvertConfig::new("/nonexistent/llm-batch/root");
        assert!(config.validate().unwrap_err().is_config());
        assert!(ConvertConfig::new(".").parallelism(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_convert_writes_one_line_per_file() {
        let temp = fixture();
        let out = temp.child("out.jsonl");
        let config = ConvertConfig::new(temp.path())
            .include("rs,png")
            .output(out.path())
            .parallelism(2)
            .gzip(false);

        let stats = convert(&config).await.unwrap();
        assert_eq!(stats.gzip_output, None);
        assert!(!temp.child("out.jsonl.gz").path().exists());
        assert_eq!(stats.files_found, 3);
        assert_eq!(stats.converted, 3);
        assert_eq!(stats.failed, 0);

        let rows: Vec<serde_json::Value> = std::fs::read_to_string(out.path())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 3);
        let quoted = rows
            .iter()
            .find(|r| r["url"].as_str().unwrap().ends_with("quote.RS"))
            .unwrap();
        assert_eq!(quoted["text"], "let s = \"tab\\there\";");

        // Extension keys are lowercased and ranked by bytes.
        assert_eq!(stats.extensions[0].extension, "rs");
        assert_eq!(stats.extensions[0].stats.files, 2);
        assert_eq!(stats.extensions[1].extension, "png");
    }

    #[tokio::test]
    async fn test_output_inside_root_is_not_read_back() {
        let temp = fixture();
        let config = ConvertConfig::new(temp.path()).include("md,jsonl").output(temp.path());

        // A stale output from an earlier run must not be converted.
        temp.child(DEFAULT_OUTPUT_FILE).write_str("{\"text\":\"old\"}\n").unwrap();
        let stats = convert(&config).await.unwrap();
        assert_eq!(stats.files_found, 1);
        assert_eq!(stats.output, temp.path().join(DEFAULT_OUTPUT_FILE));
    }

    #[tokio::test]
    async fn test_gzip_copy_decompresses_to_output() {
        use std::io::Read;

        let temp = fixture();
        let out = temp.child("out/data.jsonl");
        let config = ConvertConfig::new(temp.path()).include("rs,md,png").output(out.path());

        let stats = convert(&config).await.unwrap();
        let gz = stats.gzip_output.clone().unwrap();
        assert_eq!(gz, temp.child("out/data.jsonl.gz").path());

        let mut unpacked = String::new();
        flate2::read::GzDecoder::new(std::fs::File::open(&gz).unwrap())
            .read_to_string(&mut unpacked)
            .unwrap();
        assert_eq!(unpacked, std::fs::read_to_string(out.path()).unwrap());
        assert_eq!(unpacked.lines().count(), 4);

        // Running again with "gz" included must not pick up the old copy.
        let again = ConvertConfig::new(temp.path()).include("gz,md").output(out.path());
        assert_eq!(convert(&again).await.unwrap().files_found, 1);
    }

    #[tokio::test]
    async fn test_no_matching_files_is_an_error() {
        let temp = fixture();
        let config = ConvertConfig::new(temp.path())
            .include("docx")
            .output(temp.path().join("x.jsonl"));
        let err = convert(&config).await.unwrap_err();
        assert!(matches!(err, Error::NoInput { .. }));
    }

    #[test]
    fn test_rank_by_bytes_then_files_then_extension() {
        let agg: PartialAggregate<String, FileStats> = [
            ("md".to_string(), FileStats { files: 1, bytes: 10 }),
            ("rs".to_string(), FileStats { files: 3, bytes: 10 }),
            ("go".to_string(), FileStats { files: 3, bytes: 10 }),
            ("png".to_string(), FileStats { files: 1, bytes: 99 }),
        ]
        .into_iter()
        .collect();
        let order: Vec<&str> = agg
            .ranked_by(FileStats::rank)
            .into_iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(order, vec!["png", "go", "rs", "md"]);
    }
}
