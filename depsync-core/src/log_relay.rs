//! Forwards a subprocess's output to the master in batches.
//!
//! Two reader tasks (stdout, stderr) push lines into one channel. A single
//! owner task holds the buffer, flushes every [`FLUSH_EVERY`] lines and
//! flushes the remainder once both readers hit EOF.

use crate::protocol::{LogBatch, Message, OperationCode};
use crate::transport::Link;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub const FLUSH_EVERY: usize = 10;

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn flush(&self, task_id: Uuid, lines: Vec<String>);
}

/// Sends `insert_logs` batches to the master.
pub struct MasterLogSink {
    link: Arc<Link>,
    master_key: String,
}

impl MasterLogSink {
    pub fn new(link: Arc<Link>, master_key: impl Into<String>) -> Self {
        Self {
            link,
            master_key: master_key.into(),
        }
    }
}

#[async_trait]
impl LogSink for MasterLogSink {
    async fn flush(&self, task_id: Uuid, lines: Vec<String>) {
        let count = lines.len();
        let msg = match Message::new(OperationCode::InsertLogs, &LogBatch { task_id, lines }) {
            Ok(m) => m,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to encode log batch");
                return;
            }
        };
        match self.link.send_message(&self.master_key, &msg).await {
            Ok(()) => debug!(task_id = %task_id, count, "log batch sent"),
            Err(e) => warn!(task_id = %task_id, error = %e, "log batch lost"),
        }
    }
}

#[derive(Clone)]
pub struct LogRelay {
    task_id: Uuid,
    sink: Arc<dyn LogSink>,
}

impl LogRelay {
    pub fn new(task_id: Uuid, sink: Arc<dyn LogSink>) -> Self {
        Self { task_id, sink }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Starts relaying both streams. The handle resolves to the number of
    /// lines relayed once everything has been flushed.
    pub fn attach<O, E>(&self, stdout: O, stderr: E) -> JoinHandle<usize>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(FLUSH_EVERY * 4);
        tokio::spawn(read_lines(stdout, tx.clone()));
        tokio::spawn(read_lines(stderr, tx));
        tokio::spawn(drain(self.task_id, self.sink.clone(), rx))
    }
}

/// Relays `reader` line by line until EOF. Invalid UTF-8 is replaced, and the
/// stream is drained to the end even when the relay stops accepting lines so
/// the child never writes into a closed pipe.
async fn read_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "output stream read failed");
                break;
            }
        }
    }
    if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
        debug!(error = %e, "output stream drain failed");
    }
}

async fn drain(task_id: Uuid, sink: Arc<dyn LogSink>, mut rx: mpsc::Receiver<String>) -> usize {
    let mut buffer = Vec::with_capacity(FLUSH_EVERY);
    let mut total = 0;
    while let Some(line) = rx.recv().await {
        total += 1;
        buffer.push(line);
        if buffer.len() >= FLUSH_EVERY {
            sink.flush(task_id, std::mem::take(&mut buffer)).await;
        }
    }
    if !buffer.is_empty() {
        sink.flush(task_id, buffer).await;
    }
    total
}
