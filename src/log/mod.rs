//! Append-only detection log.
//!
//! CSV with a fixed header written once at creation, then one row per
//! surviving detection. Every `append` is flushed and synced before it
//! returns, so a crash after a successful append cannot lose or tear the
//! rows it wrote. A failed append is rolled back to the last committed
//! length, so earlier rows stay readable.

use anyhow::{anyhow, Context};
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

mod record;
mod verify;
mod writer;

pub use record::{round_confidence, DetectionRecord};
pub use verify::{verify_log_with, LogSummary};
pub use writer::{LogHandle, LogWriter, LogWriterSummary};

pub const LOG_HEADER: [&str; 4] = [
    "Timestamp (24H)",
    "Class",
    "Confidence",
    "Number of Detections",
];

/// Storage behind a `DetectionLog`.
pub trait LogSink: Write + Send {
    /// Make everything written so far durable.
    fn sync(&mut self) -> io::Result<()>;

    /// Drop everything past the first `len` bytes. Later writes continue at `len`.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

/// Owned handle on an open detection log.
pub struct DetectionLog {
    sink: Box<dyn LogSink>,
    path: PathBuf,
    /// Bytes known to be durable.
    committed: u64,
    rows_written: u64,
}

impl DetectionLog {
    /// Create (or truncate) the log at `path` and write the header.
    pub fn initialize(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;
        Self::with_sink(file, path)
    }

    /// Start a log on an empty `sink`. `path` is only used for reporting.
    pub fn with_sink(sink: impl LogSink + 'static, path: impl Into<PathBuf>) -> Result<Self> {
        let mut log = Self {
            sink: Box::new(sink),
            path: path.into(),
            committed: 0,
            rows_written: 0,
        };
        let header = encode_rows(std::iter::once(LOG_HEADER))?;
        log.commit(&header)?;
        Ok(log)
    }

    /// Append a batch. The batch is durable once this returns `Ok`; on `Err`
    /// none of it is left in the log.
    pub fn append(&mut self, records: &[DetectionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let bytes = encode_rows(records.iter().map(DetectionRecord::to_row))?;
        self.commit(&bytes)?;
        self.rows_written += records.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data rows appended through this handle.
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn commit(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(err) = write_durably(self.sink.as_mut(), bytes) {
            if let Err(rollback) = self.sink.truncate(self.committed) {
                log::error!(
                    "could not roll {} back to {} bytes: {}",
                    self.path.display(),
                    self.committed,
                    rollback
                );
            }
            return Err(err.into());
        }
        self.committed += bytes.len() as u64;
        Ok(())
    }
}

fn write_durably(sink: &mut dyn LogSink, bytes: &[u8]) -> io::Result<()> {
    sink.write_all(bytes)?;
    sink.flush()?;
    sink.sync()
}

fn encode_rows<I, R>(rows: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator,
    R::Item: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|err| Error::from(io::Error::new(err.error().kind(), err.to_string())))
}

/// Read a detection log back into records. Fails on a missing or altered
/// header and on any malformed row.
pub fn read_log(path: impl AsRef<Path>) -> anyhow::Result<Vec<DetectionRecord>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("open detection log {}", path.display()))?;

    let headers = reader.headers().context("read log header")?.clone();
    if headers.iter().ne(LOG_HEADER.iter().copied()) {
        return Err(anyhow!(
            "unexpected log header {:?} in {}",
            headers,
            path.display()
        ));
    }

    reader
        .records()
        .enumerate()
        .map(|(idx, row)| {
            let row = row.with_context(|| format!("read row {}", idx + 1))?;
            DetectionRecord::from_row(&row).with_context(|| format!("parse row {}", idx + 1))
        })
        .collect()
}

/// Sinks for exercising write failures.
#[cfg(test)]
pub(crate) mod testing {
    use super::LogSink;
    use std::fs::File;
    use std::io::{self, Write};
    use std::path::Path;

    /// A file that refuses to grow past `cap` bytes, like a process under
    /// `ulimit -f`. A write crossing the cap lands partially, then fails.
    pub(crate) struct CappedFile {
        file: File,
        cap: u64,
        pos: u64,
    }

    impl CappedFile {
        pub(crate) fn create(path: &Path, cap: u64) -> Self {
            Self {
                file: File::create(path).unwrap(),
                cap,
                pos: 0,
            }
        }
    }

    impl Write for CappedFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.cap.saturating_sub(self.pos) as usize;
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "file size limit exceeded"));
            }
            let n = self.file.write(&buf[..buf.len().min(room)])?;
            self.pos += n as u64;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl LogSink for CappedFile {
        fn sync(&mut self) -> io::Result<()> {
            self.file.sync_data()
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            LogSink::truncate(&mut self.file, len)?;
            self.pos = len;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimeBucket;
    use tempfile::tempdir;

    fn rec(secs: u64, label: &str, conf: f32, n: usize) -> DetectionRecord {
        DetectionRecord::new(TimeBucket::from_secs(secs), label, conf, n)
    }

    #[test]
    fn initialize_writes_header_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("detections_log.csv");
        let log = DetectionLog::initialize(&path).unwrap();
        drop(log);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            raw,
            "Timestamp (24H),Class,Confidence,Number of Detections\r\n"
        );
        assert!(read_log(&path).unwrap().is_empty());
    }

    #[test]
    fn initialize_truncates_existing_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        {
            let mut log = DetectionLog::initialize(&path).unwrap();
            log.append(&[rec(1, "person", 0.5, 1)]).unwrap();
        }
        DetectionLog::initialize(&path).unwrap();
        assert!(read_log(&path).unwrap().is_empty());
    }

    #[test]
    fn appended_rows_are_visible_without_closing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut log = DetectionLog::initialize(&path).unwrap();
        log.append(&[rec(0, "person", 0.42, 1)]).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with("00:00:00,person,0.42,1\r\n"));
        assert_eq!(log.rows_written(), 1);
    }

    #[test]
    fn labels_with_commas_are_quoted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut log = DetectionLog::initialize(&path).unwrap();
        let odd = rec(2, "cat, small", 0.61, 1);
        log.append(std::slice::from_ref(&odd)).unwrap();
        assert_eq!(read_log(&path).unwrap(), vec![odd]);
    }

    #[test]
    fn read_log_rejects_foreign_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("other.csv");
        std::fs::write(&path, "a,b,c,d\r\n").unwrap();
        assert!(read_log(&path).is_err());
    }

    #[test]
    fn failed_append_rolls_back_to_last_good_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        // header is 55 bytes, each row below 24
        let mut log = DetectionLog::with_sink(testing::CappedFile::create(&path, 100), &path)
            .unwrap();
        log.append(&[rec(0, "person", 0.42, 1)]).unwrap();
        let good_len = std::fs::metadata(&path).unwrap().len();

        let result = log.append(&[rec(1, "person", 0.90, 2), rec(1, "car", 0.55, 2)]);
        assert!(matches!(result, Err(Error::Persistence(_))));
        assert_eq!(log.rows_written(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
        assert_eq!(read_log(&path).unwrap(), vec![rec(0, "person", 0.42, 1)]);
    }

    #[test]
    fn append_of_empty_batch_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut log = DetectionLog::initialize(&path).unwrap();
        let before = std::fs::metadata(&path).unwrap().len();
        log.append(&[]).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);
    }
}
