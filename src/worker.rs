use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, warn};
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::http_utils;
use crate::range_table::RangeTable;
use crate::sink::FileSink;
use crate::types::{ChunkReport, TransferUpdate};

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub(crate) enum WorkerError {
    #[error("range request at offset {offset} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        offset: u64,
        attempts: u32,
        source: reqwest::Error,
    },
    #[error("server answered a ranged request with {status}")]
    NoPartialContent { status: StatusCode },
    #[error("write failed at offset {offset}")]
    WriteFailed { offset: u64 },
    #[error("short write at offset {offset}: {written}/{requested} bytes")]
    ShortWrite {
        offset: u64,
        written: u64,
        requested: u64,
    },
}

enum RangeOutcome {
    Finished,
    Cancelled,
}

/// One logical unit of fetch work. A worker owns exactly one byte range at a
/// time; when it exhausts that range it asks the table for a steal and
/// continues in place, so the number of live tasks never grows past the
/// initial worker count.
pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) url: Url,
    pub(crate) client: Client,
    pub(crate) table: Arc<RangeTable>,
    pub(crate) sink: Arc<FileSink>,
    pub(crate) updates: mpsc::Sender<TransferUpdate>,
    pub(crate) cancel: CancellationToken,
    /// Negative means retry forever.
    pub(crate) retry_limit: i32,
    pub(crate) read_chunk_size: usize,
    pub(crate) steal_enabled: bool,
}

impl Worker {
    pub(crate) fn spawn(self, range: (u64, u64)) -> JoinHandle<()> {
        tokio::spawn(self.run(range))
    }

    async fn run(self, (mut start, mut end): (u64, u64)) {
        let result = loop {
            match self.fetch_range(start, end).await {
                Ok(RangeOutcome::Cancelled) => break Ok(()),
                Ok(RangeOutcome::Finished) => {
                    self.table.remove_range(start).await;
                    if !self.steal_enabled {
                        break Ok(());
                    }
                    match self.table.pick_largest_undownloaded().await {
                        Some((stolen_start, stolen_end)) => {
                            debug!(
                                "worker {}: done with {start}..{end}, stole {stolen_start}..{stolen_end}",
                                self.id
                            );
                            start = stolen_start;
                            end = stolen_end;
                        }
                        None => break Ok(()),
                    }
                }
                Err(e) => break Err(e),
            }
        };
        // Exactly one completion per logical task, after the whole chain of
        // owned and stolen ranges.
        self.updates.send(TransferUpdate::Done(result)).await.ok();
    }

    /// Ranged fetch of `[start, end)` with retry and resume. `offset` tracks
    /// the next unwritten byte; a resumed request always starts there, never
    /// before, so no byte is fetched twice. `known_end` is refreshed from the
    /// table after every write because a steal may shrink it at any time.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<RangeOutcome, WorkerError> {
        let mut offset = start;
        let mut known_end = end;
        let mut retries: u32 = 0;

        'request: loop {
            if self.cancel.is_cancelled() {
                return Ok(RangeOutcome::Cancelled);
            }
            if offset >= known_end {
                return Ok(RangeOutcome::Finished);
            }

            let request = self
                .client
                .get(self.url.clone())
                .header(RANGE, http_utils::range_header(offset, known_end));
            let response = match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => response,
                Err(e) => {
                    if self.retries_left(retries) {
                        retries += 1;
                        warn!(
                            "worker {}: request for bytes {offset}..{known_end} failed ({e}), retry {retries}",
                            self.id
                        );
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue 'request;
                    }
                    return Err(WorkerError::RetriesExhausted {
                        offset,
                        attempts: retries + 1,
                        source: e,
                    });
                }
            };
            if response.status() != StatusCode::PARTIAL_CONTENT {
                // A server that ignores the Range header streams the whole
                // resource; writing that at our offset would corrupt the
                // file, and retrying cannot change its range support.
                return Err(WorkerError::NoPartialContent {
                    status: response.status(),
                });
            }

            let mut body = response.bytes_stream();
            loop {
                if self.cancel.is_cancelled() {
                    return Ok(RangeOutcome::Cancelled);
                }
                match body.next().await {
                    None => {
                        if offset < known_end {
                            warn!(
                                "worker {}: stream ended {} bytes short of {known_end}",
                                self.id,
                                known_end - offset
                            );
                        }
                        return Ok(RangeOutcome::Finished);
                    }
                    Some(Err(e)) => {
                        if self.retries_left(retries) {
                            retries += 1;
                            warn!(
                                "worker {}: read failed at offset {offset} ({e}), resuming, retry {retries}",
                                self.id
                            );
                            tokio::time::sleep(RETRY_BACKOFF).await;
                            // offset has advanced past every written byte, so
                            // the reissued request resumes exactly there.
                            continue 'request;
                        }
                        return Err(WorkerError::RetriesExhausted {
                            offset,
                            attempts: retries + 1,
                            source: e,
                        });
                    }
                    Some(Ok(chunk)) => {
                        for piece in chunk.chunks(self.read_chunk_size) {
                            let available = known_end.saturating_sub(offset);
                            if available == 0 {
                                // A steal claimed the rest while this chunk
                                // was in flight.
                                return Ok(RangeOutcome::Finished);
                            }
                            let piece = &piece[..cmp::min(piece.len(), available as usize)];
                            offset += self.write_and_report(piece, offset).await?;
                            known_end = self.table.update_range(start, offset).await;
                            if offset >= known_end {
                                return Ok(RangeOutcome::Finished);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Positional write plus the chunk report the coordinator aggregates.
    /// Disk failures and short writes are fatal for the whole task.
    async fn write_and_report(&self, piece: &[u8], offset: u64) -> Result<u64, WorkerError> {
        let requested = piece.len() as u64;
        let (bytes_written, write_error) = match self.sink.write_at(piece, offset) {
            Ok(n) => (n as u64, None),
            Err(e) => (0, Some(e)),
        };
        let failed = write_error.is_some();
        self.updates
            .send(TransferUpdate::Progress(ChunkReport {
                offset,
                length: requested,
                bytes_written,
                write_error,
            }))
            .await
            .ok();

        if failed {
            return Err(WorkerError::WriteFailed { offset });
        }
        if bytes_written != requested {
            return Err(WorkerError::ShortWrite {
                offset,
                written: bytes_written,
                requested,
            });
        }
        Ok(bytes_written)
    }

    fn retries_left(&self, used: u32) -> bool {
        retries_remaining(self.retry_limit, used)
    }
}

fn retries_remaining(limit: i32, used: u32) -> bool {
    limit < 0 || i64::from(used) < i64::from(limit)
}
