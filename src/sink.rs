//! Sink writer: drains a result stream into a line-oriented file.
//!
//! The sink is the only consumer of the pool's result channel, so the file
//! handle needs no lock. Records are written one by one in the order they
//! are pulled; the target is flushed and synced before [`LineSink::drain`]
//! reports success. A write failure stops writing and cancels the run the
//! sink was attached to with [`LineSink::cancel_on_failure`], but the
//! channel is still drained so the error can name every record that never
//! reached the file.
//!
//! Lines are JSON for the batch tools and CSV rows for the evaluator; see
//! [`csv_line`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Something the sink can persist.
pub trait Record {
    /// One line without the trailing newline, or `None` if this record is
    /// not written.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized.
    fn render(&self) -> Result<Option<String>>;

    /// Short identifier used when reporting lost records.
    fn label(&self) -> String;
}

/// A write target that can be forced to stable storage.
#[async_trait]
pub trait Durable: AsyncWrite + Unpin + Send {
    /// Flushes buffers and, for files, syncs to disk.
    async fn persist(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl Durable for tokio::fs::File {
    async fn persist(&mut self) -> std::io::Result<()> {
        self.flush().await?;
        self.sync_all().await
    }
}

#[async_trait]
impl Durable for Vec<u8> {
    async fn persist(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Outcome of a successful drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkReport {
    /// Records written
    pub written: usize,
    /// Records pulled but not meant to be written
    pub skipped: usize,
    /// Target path, if the sink writes a file
    pub path: Option<PathBuf>,
}

/// Gzip compressed copy of everything the sink writes.
struct GzipCopy {
    path: PathBuf,
    encoder: GzEncoder<fs::File>,
}

impl std::fmt::Debug for GzipCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipCopy").field("path", &self.path).finish_non_exhaustive()
    }
}

impl GzipCopy {
    fn finish(&mut self) -> std::io::Result<()> {
        self.encoder.try_finish()?;
        self.encoder.get_ref().sync_all()
    }
}

/// Sequential line writer.
#[derive(Debug)]
pub struct LineSink<W> {
    writer: W,
    path: Option<PathBuf>,
    gzip: Option<GzipCopy>,
    cancel: Option<CancellationToken>,
}

impl LineSink<tokio::fs::File> {
    /// Creates (or truncates) `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be created.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::io(path, e))?;
        debug!("Opened sink {}", path.display());
        Ok(Self {
            writer: file,
            path: Some(path.to_path_buf()),
            gzip: None,
            cancel: None,
        })
    }

    /// Also writes every line to `{path}.gz`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the compressed file cannot be created.
    pub fn with_gzip_copy(mut self) -> Result<Self> {
        let Some(path) = &self.path else {
            return Err(Error::config("gzip copy needs a file sink"));
        };
        let gz_path = gzip_path(path);
        let file = fs::File::create(&gz_path).map_err(|e| Error::io(&gz_path, e))?;
        debug!("Opened compressed copy {}", gz_path.display());
        self.gzip = Some(GzipCopy {
            path: gz_path,
            encoder: GzEncoder::new(file, Compression::default()),
        });
        Ok(self)
    }
}

/// Path of the compressed copy of `path`: the same name plus `.gz`.
#[must_use]
pub fn gzip_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

impl<W: Durable> LineSink<W> {
    /// Wraps an arbitrary writer.
    pub const fn from_writer(writer: W) -> Self {
        Self {
            writer,
            path: None,
            gzip: None,
            cancel: None,
        }
    }

    /// Cancels `token` on the first failed render or write, so the
    /// producers stop instead of computing records that will be lost.
    pub fn cancel_on_failure(&mut self, token: CancellationToken) {
        self.cancel = Some(token);
    }

    /// Path of the compressed copy, if one is written.
    #[must_use]
    pub fn gzip_copy_path(&self) -> Option<&Path> {
        self.gzip.as_ref().map(|gz| gz.path.as_path())
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Writes one line that is not a record, such as a CSV header.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the write fails.
    pub async fn write_header(&mut self, line: &str) -> Result<()> {
        let path = self.display_path();
        let mut buf = line.as_bytes().to_vec();
        buf.push(b'\n');
        self.write_line(&buf).await.map_err(|e| Error::io(path, e))
    }

    async fn write_line(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(buf).await?;
        if let Some(gz) = &mut self.gzip {
            gz.encoder.write_all(buf)?;
        }
        Ok(())
    }

    async fn persist(&mut self) -> std::io::Result<()> {
        self.writer.persist().await?;
        if let Some(gz) = &mut self.gzip {
            gz.finish()?;
        }
        Ok(())
    }

    fn display_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| PathBuf::from("<writer>"))
    }

    /// Writes every record pulled from `rx` until the channel closes.
    ///
    /// `on_record` sees each record as it is pulled, before it is written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sink`] on the first failed write or render. Records
    /// written before the failure stay in place.
    pub async fn drain<T, F>(&mut self, rx: &mut UnboundedReceiver<T>, mut on_record: F) -> Result<SinkReport>
    where
        T: Record + Send,
        F: FnMut(&T) + Send,
    {
        let mut written = 0;
        let mut skipped = 0;

        while let Some(record) = rx.recv().await {
            on_record(&record);
            let line = match record.render() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(self.abort(rx, written, record.label(), e.to_string()).await),
            };

            let mut buf = line.into_bytes();
            buf.push(b'\n');
            if let Err(e) = self.write_line(&buf).await {
                return Err(self.abort(rx, written, record.label(), e.to_string()).await);
            }
            written += 1;
        }

        if let Err(e) = self.persist().await {
            error!("Failed to persist {}: {e}", self.display_path().display());
            return Err(Error::Sink {
                path: self.display_path(),
                written,
                lost: Vec::new(),
                message: e.to_string(),
            });
        }

        if let Some(path) = &self.path {
            info!("Wrote {written} records to {}", path.display());
        }
        Ok(SinkReport {
            written,
            skipped,
            path: self.path.clone(),
        })
    }

    async fn abort<T: Record>(
        &mut self,
        rx: &mut UnboundedReceiver<T>,
        written: usize,
        failed: String,
        message: String,
    ) -> Error {
        error!(
            "Sink {} failed after {written} records: {message}",
            self.display_path().display()
        );
        if let Some(token) = &self.cancel {
            token.cancel();
        }
        let mut lost = vec![failed];
        while let Some(record) = rx.recv().await {
            lost.push(record.label());
        }
        // Best effort: keep what was already written.
        let _ = self.persist().await;
        Error::Sink {
            path: self.display_path(),
            written,
            lost,
            message,
        }
    }
}

/// Renders `fields` as one CSV row without the trailing newline.
///
/// Fields are quoted only when needed; a quoted field may span lines.
///
/// # Errors
///
/// Returns a CSV error if the row cannot be encoded.
pub fn csv_line<I, S>(fields: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    let mut bytes = writer.into_inner().map_err(|e| Error::Csv {
        message: e.to_string(),
    })?;
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
    }
    String::from_utf8(bytes).map_err(|e| Error::Csv {
        message: e.to_string(),
    })
}

/// Serializes `value` as pretty JSON and writes it atomically.
///
/// # Process
///
/// 1. Writes content to a temporary file beside `path`
/// 2. Syncs the temporary file to disk
/// 3. Renames it over `path`
///
/// # Errors
///
/// Returns an error if serialization or any file operation fails.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;

    let temp_path = path.with_extension("tmp");
    let mut temp_file = fs::File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;
    temp_file
        .write_all(&content)
        .map_err(|e| Error::io(&temp_path, e))?;
    temp_file.sync_all().map_err(|e| Error::io(&temp_path, e))?;
    drop(temp_file);

    fs::rename(&temp_path, path).map_err(|e| Error::io(path, e))?;
    debug!("Wrote {}", path.display());
    Ok(())
}
