use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::{future, StreamExt};
use indicatif::MultiProgress;
use log::{debug, info};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::http_utils;
use crate::progress_reporter::{format_speed, spawn_progress_reporter};
use crate::range_table::RangeTable;
use crate::resource::{self, ProbeError};
use crate::sink::FileSink;
use crate::types::{ByteCount, TransferUpdate};
use crate::worker::{Worker, WorkerError};

const READ_CHUNK_MIN: usize = 4096;
const READ_CHUNK_MAX: usize = 32768;
/// A steal has to pay for an extra request round-trip, so the split-off
/// piece is kept at a healthy multiple of the read size.
const MIN_STEAL_MULTIPLIER: u64 = 10;

#[derive(Error, Debug)]
pub(crate) enum DownloadError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("writing chunk at offset {offset}: {source}")]
    ChunkWrite {
        offset: u64,
        source: std::io::Error,
    },
    #[error("short write at offset {offset}: {written}/{requested} bytes")]
    ShortWrite {
        offset: u64,
        written: u64,
        requested: u64,
    },
    #[error("output file: {0}")]
    Output(#[from] std::io::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DownloadOptions {
    pub(crate) worker_count: usize,
    /// Negative means retry forever.
    pub(crate) retry_limit: i32,
    pub(crate) read_chunk_size: usize,
    pub(crate) enable_work_stealing: bool,
    pub(crate) insecure: bool,
    /// Download even when the local copy looks current.
    pub(crate) force: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            retry_limit: 3,
            read_chunk_size: READ_CHUNK_MAX,
            enable_work_stealing: true,
            insecure: false,
            force: false,
        }
    }
}

impl DownloadOptions {
    fn clamped_chunk_size(&self) -> usize {
        self.read_chunk_size.clamp(READ_CHUNK_MIN, READ_CHUNK_MAX)
    }

    fn min_steal_chunk(&self) -> u64 {
        self.clamped_chunk_size() as u64 * MIN_STEAL_MULTIPLIER
    }
}

pub(crate) struct DownloadPreferences {
    pub(crate) url: Url,
    pub(crate) output: Option<PathBuf>,
    pub(crate) options: DownloadOptions,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DownloadOutcome {
    /// The local file already matches the remote resource.
    UpToDate,
    Completed { total_bytes: ByteCount },
}

pub(crate) async fn start_download(
    prefs: DownloadPreferences,
    multi: MultiProgress,
) -> Result<DownloadOutcome, DownloadError> {
    let output = prefs
        .output
        .clone()
        .unwrap_or_else(|| infer_output(&prefs.url));
    let opts = prefs.options;

    let spec = resource::probe(&prefs.url, &output, opts.insecure).await?;
    if !spec.need_download && !opts.force {
        info!("{} is up to date, skipping download", output.display());
        return Ok(DownloadOutcome::UpToDate);
    }
    let client = http_utils::build_client(spec.transport, opts.insecure)?;

    match spec.content_length {
        Some(total) => download_ranged(&prefs.url, client, &output, total, opts, multi).await,
        None => {
            // Without a known upper bound there is nothing to partition.
            debug!("content length unknown, falling back to a sequential copy");
            download_sequential(&prefs.url, client, &output, multi).await
        }
    }
}

fn infer_output(url: &Url) -> PathBuf {
    url.path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
        .unwrap_or("download")
        .into()
}

/// Contiguous equal split of `[0, total)` with the remainder folded into the
/// last range. The worker count is capped at the byte count so no range ever
/// starts out empty.
fn partition(total: u64, workers: usize) -> Vec<(u64, u64)> {
    let workers = (workers.max(1) as u64).min(total);
    let per_worker = total / workers;
    (0..workers)
        .map(|i| {
            let start = i * per_worker;
            let end = if i == workers - 1 {
                total
            } else {
                start + per_worker
            };
            (start, end)
        })
        .collect()
}

async fn download_ranged(
    url: &Url,
    client: reqwest::Client,
    output: &std::path::Path,
    total: u64,
    opts: DownloadOptions,
    multi: MultiProgress,
) -> Result<DownloadOutcome, DownloadError> {
    let started = Instant::now();
    let sink = Arc::new(FileSink::create(output, total)?);
    let table = Arc::new(RangeTable::new(opts.min_steal_chunk()));
    let cancel = CancellationToken::new();

    let ranges = partition(total, opts.worker_count);
    let worker_count = ranges.len();
    debug!("downloading {total} bytes with {worker_count} workers");

    let (tx_updates, mut rx_updates) = mpsc::channel::<TransferUpdate>(worker_count);
    let (tx_progress, rx_progress) = mpsc::channel::<ByteCount>(worker_count);
    let reporter = spawn_progress_reporter(Some(total), rx_progress, multi);

    // Every initial range is registered before any worker runs, so the first
    // steal already sees the whole partition.
    for &(start, end) in &ranges {
        table.add_range(start, end).await;
    }
    let mut handles = Vec::with_capacity(worker_count);
    for (id, &(start, end)) in ranges.iter().enumerate() {
        let worker = Worker {
            id,
            url: url.clone(),
            client: client.clone(),
            table: table.clone(),
            sink: sink.clone(),
            updates: tx_updates.clone(),
            cancel: cancel.clone(),
            retry_limit: opts.retry_limit,
            read_chunk_size: opts.clamped_chunk_size(),
            steal_enabled: opts.enable_work_stealing,
        };
        handles.push(worker.spawn((start, end)));
    }
    drop(tx_updates);

    let mut total_written: ByteCount = 0;
    let mut finished = 0usize;
    let mut failure: Option<DownloadError> = None;

    while let Some(update) = rx_updates.recv().await {
        match update {
            TransferUpdate::Progress(report) => {
                if let Some(e) = report.write_error {
                    failure = Some(DownloadError::ChunkWrite {
                        offset: report.offset,
                        source: e,
                    });
                    break;
                }
                if report.bytes_written != report.length {
                    failure = Some(DownloadError::ShortWrite {
                        offset: report.offset,
                        written: report.bytes_written,
                        requested: report.length,
                    });
                    break;
                }
                total_written += report.bytes_written;
                tx_progress.send(report.bytes_written).await.ok();
            }
            TransferUpdate::Done(Ok(())) => {
                finished += 1;
                debug!("{finished}/{worker_count} workers finished");
                if finished == worker_count {
                    break;
                }
            }
            TransferUpdate::Done(Err(e)) => {
                failure = Some(e.into());
                break;
            }
        }
    }

    // First failure (or full completion) ends the transfer; stragglers get
    // the cooperative stop signal and their pending sends fail harmlessly
    // once the receiver is gone.
    cancel.cancel();
    drop(rx_updates);
    future::join_all(handles).await;

    drop(tx_progress);
    reporter.await.ok();

    sink.sync()?;
    if let Some(e) = failure {
        return Err(e);
    }

    let elapsed = started.elapsed();
    info!(
        "{total_written} bytes received and written to {} in {:.1}s at {}",
        output.display(),
        elapsed.as_secs_f64(),
        format_speed(total_written as f64 / elapsed.as_secs_f64().max(f64::EPSILON)),
    );
    Ok(DownloadOutcome::Completed {
        total_bytes: total_written,
    })
}

/// Degraded mode for resources of unknown length: one plain GET, no range
/// headers, no stealing, streamed straight into the file.
async fn download_sequential(
    url: &Url,
    client: reqwest::Client,
    output: &std::path::Path,
    multi: MultiProgress,
) -> Result<DownloadOutcome, DownloadError> {
    let started = Instant::now();
    let response = client
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?;

    let (tx_progress, rx_progress) = mpsc::channel::<ByteCount>(1);
    let reporter = spawn_progress_reporter(None, rx_progress, multi);

    let mut file = tokio::fs::File::create(output).await?;
    let mut body = response.bytes_stream();
    let mut total_written: ByteCount = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        total_written += chunk.len() as ByteCount;
        tx_progress.send(chunk.len() as ByteCount).await.ok();
    }
    file.flush().await?;

    drop(tx_progress);
    reporter.await.ok();

    let elapsed = started.elapsed();
    info!(
        "{total_written} bytes received and written to {} in {:.1}s at {}",
        output.display(),
        elapsed.as_secs_f64(),
        format_speed(total_written as f64 / elapsed.as_secs_f64().max(f64::EPSILON)),
    );
    Ok(DownloadOutcome::Completed {
        total_bytes: total_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pattern, RangeResponder};
    use indicatif::ProgressDrawTarget;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hidden_progress() -> MultiProgress {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    }

    async fn mock_resource(body: &[u8]) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(RangeResponder::new(body.to_vec()))
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn partition_splits_evenly_with_remainder_on_last() {
        assert_eq!(
            partition(1_000_000, 4),
            vec![
                (0, 250_000),
                (250_000, 500_000),
                (500_000, 750_000),
                (750_000, 1_000_000),
            ]
        );
        assert_eq!(partition(10, 3), vec![(0, 3), (3, 6), (6, 10)]);
    }

    #[test]
    fn partition_caps_workers_at_total_bytes() {
        assert_eq!(partition(2, 4), vec![(0, 1), (1, 2)]);
        assert_eq!(partition(1, 8), vec![(0, 1)]);
    }

    #[test]
    fn chunk_size_is_clamped_and_steal_chunk_derived() {
        let small = DownloadOptions {
            read_chunk_size: 100,
            ..DownloadOptions::default()
        };
        assert_eq!(small.clamped_chunk_size(), 4096);

        let large = DownloadOptions {
            read_chunk_size: 1 << 20,
            ..DownloadOptions::default()
        };
        assert_eq!(large.clamped_chunk_size(), 32768);

        let spec_example = DownloadOptions {
            read_chunk_size: 8192,
            ..DownloadOptions::default()
        };
        assert_eq!(spec_example.min_steal_chunk(), 81_920);
    }

    #[test]
    fn output_name_falls_back_from_url_path() {
        let url = Url::parse("https://example.com/files/archive.tar.gz").unwrap();
        assert_eq!(infer_output(&url), PathBuf::from("archive.tar.gz"));
        let bare = Url::parse("https://example.com/").unwrap();
        assert_eq!(infer_output(&bare), PathBuf::from("download"));
    }

    #[tokio::test]
    async fn parallel_download_reassembles_the_resource() {
        let body = pattern(200_000);
        let server = mock_resource(&body).await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");

        let outcome = start_download(
            DownloadPreferences {
                url: Url::parse(&format!("{}/out.bin", server.uri())).unwrap(),
                output: Some(output.clone()),
                options: DownloadOptions {
                    worker_count: 4,
                    read_chunk_size: 4096,
                    ..DownloadOptions::default()
                },
            },
            hidden_progress(),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            DownloadOutcome::Completed {
                total_bytes: body.len() as u64
            }
        );
        assert_eq!(std::fs::read(&output).unwrap(), body);
    }

    #[tokio::test]
    async fn stealing_disabled_still_reassembles_the_resource() {
        let body = pattern(120_000);
        let server = mock_resource(&body).await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");

        let outcome = start_download(
            DownloadPreferences {
                url: Url::parse(&format!("{}/out.bin", server.uri())).unwrap(),
                output: Some(output.clone()),
                options: DownloadOptions {
                    worker_count: 3,
                    enable_work_stealing: false,
                    ..DownloadOptions::default()
                },
            },
            hidden_progress(),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            DownloadOutcome::Completed {
                total_bytes: body.len() as u64
            }
        );
        assert_eq!(std::fs::read(&output).unwrap(), body);
    }

    #[tokio::test]
    async fn matching_local_file_short_circuits_unless_forced() {
        let body = pattern(50_000);
        let server = mock_resource(&body).await;
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");
        std::fs::write(&output, &body).unwrap();

        let url = Url::parse(&format!("{}/out.bin", server.uri())).unwrap();
        let outcome = start_download(
            DownloadPreferences {
                url: url.clone(),
                output: Some(output.clone()),
                options: DownloadOptions::default(),
            },
            hidden_progress(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, DownloadOutcome::UpToDate);

        let outcome = start_download(
            DownloadPreferences {
                url,
                output: Some(output.clone()),
                options: DownloadOptions {
                    force: true,
                    ..DownloadOptions::default()
                },
            },
            hidden_progress(),
        )
        .await
        .unwrap();
        assert_eq!(
            outcome,
            DownloadOutcome::Completed {
                total_bytes: body.len() as u64
            }
        );
    }

    #[tokio::test]
    async fn unknown_length_degrades_to_sequential_copy() {
        let body = pattern(30_000);
        let server = MockServer::start().await;
        // HEAD with an empty body advertises no usable length.
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(RangeResponder::new(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");
        let outcome = start_download(
            DownloadPreferences {
                url: Url::parse(&format!("{}/out.bin", server.uri())).unwrap(),
                output: Some(output.clone()),
                options: DownloadOptions::default(),
            },
            hidden_progress(),
        )
        .await
        .unwrap();

        // The sequential path sends no Range header, so the responder served
        // the whole body in one 200.
        assert_eq!(
            outcome,
            DownloadOutcome::Completed {
                total_bytes: body.len() as u64
            }
        );
        assert_eq!(std::fs::read(&output).unwrap(), body);
    }

    #[tokio::test]
    async fn worker_failure_fails_the_whole_transfer() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 100_000]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.bin");
        let result = start_download(
            DownloadPreferences {
                url: Url::parse(&format!("{}/out.bin", server.uri())).unwrap(),
                output: Some(output),
                options: DownloadOptions {
                    worker_count: 2,
                    retry_limit: 0,
                    ..DownloadOptions::default()
                },
            },
            hidden_progress(),
        )
        .await;

        assert!(matches!(
            result,
            Err(DownloadError::Worker(WorkerError::RetriesExhausted { .. }))
        ));
    }
}
