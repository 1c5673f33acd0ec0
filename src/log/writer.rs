//! Single-owner writer thread for the detection log.
//!
//! The log file is owned by one thread for the lifetime of the process.
//! Producers hold a cloneable `LogHandle` and block until their batch is
//! durable. Batches are written in the order they are received.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use super::{DetectionLog, DetectionRecord};
use crate::error::{Error, Result};

enum Command {
    Append(Vec<DetectionRecord>, Sender<Result<()>>),
    Shutdown,
}

/// What the writer thread did before it exited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogWriterSummary {
    pub path: PathBuf,
    pub rows_written: u64,
    pub batches: u64,
}

pub struct LogWriter {
    tx: Sender<Command>,
    thread: Option<JoinHandle<LogWriterSummary>>,
}

/// Producer side of a `LogWriter`.
#[derive(Clone)]
pub struct LogHandle {
    tx: Sender<Command>,
}

impl LogWriter {
    /// Move `log` onto a dedicated writer thread.
    pub fn spawn(log: DetectionLog) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("detection-log".to_string())
            .spawn(move || run(log, rx))
            .context("spawn detection log writer")?;
        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> LogHandle {
        LogHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop after every queued batch is written and return the totals.
    pub fn shutdown(mut self) -> anyhow::Result<LogWriterSummary> {
        let _ = self.tx.send(Command::Shutdown);
        let thread = self
            .thread
            .take()
            .context("detection log writer already stopped")?;
        thread
            .join()
            .map_err(|_| anyhow::anyhow!("detection log writer panicked"))
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send(Command::Shutdown);
            let _ = thread.join();
        }
    }
}

impl LogHandle {
    /// Append a batch and wait until it is on disk.
    pub fn append(&self, records: Vec<DetectionRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Command::Append(records, reply_tx))
            .map_err(|_| Error::Shutdown)?;
        reply_rx.recv().map_err(|_| Error::Shutdown)?
    }
}

fn run(mut log: DetectionLog, rx: Receiver<Command>) -> LogWriterSummary {
    let mut batches = 0u64;
    let mut failed = false;
    while let Ok(command) = rx.recv() {
        match command {
            Command::Append(records, reply) => {
                // A failed write is fatal for the log: later batches are
                // refused even if they would fit.
                let result = if failed {
                    Err(Error::Shutdown)
                } else {
                    log.append(&records)
                };
                match &result {
                    Ok(()) => batches += 1,
                    Err(err) if !failed => {
                        log::error!("detection log write failed: {}", err);
                        failed = true;
                    }
                    Err(_) => {}
                }
                let _ = reply.send(result);
            }
            Command::Shutdown => break,
        }
    }
    log::debug!(
        "detection log writer exiting: {} rows in {} batches",
        log.rows_written(),
        batches
    );
    LogWriterSummary {
        path: log.path().to_path_buf(),
        rows_written: log.rows_written(),
        batches,
    }
}
