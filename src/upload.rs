use std::path::Path;
use std::time::Instant;

use log::info;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::http_utils::{self, Transport};
use crate::progress_reporter::format_speed;
use crate::types::UPLOAD_FIELD_NAME;

#[derive(Error, Debug)]
pub(crate) enum UploadError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Streams a local file to the server as the `file` part of a multipart
/// POST and logs what the server answered, along with throughput.
pub(crate) async fn upload_file(server: &Url, path: &Path, insecure: bool) -> Result<(), UploadError> {
    let read_err = |source| UploadError::Read {
        path: path.display().to_string(),
        source,
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_owned());
    let file = tokio::fs::File::open(path).await.map_err(read_err)?;
    let length = file.metadata().await.map_err(read_err)?.len();

    let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), length)
        .file_name(file_name.clone());
    let form = Form::new()
        .text("title", file_name.clone())
        .part(UPLOAD_FIELD_NAME, part);

    let client = http_utils::build_client(Transport::Http1, insecure)?;
    let started = Instant::now();
    let response = client
        .post(server.clone())
        .multipart(form)
        .send()
        .await?
        .error_for_status()?;
    let reply = response.text().await?;

    let elapsed = started.elapsed();
    info!(
        "sent {length} bytes of {file_name} in {:.1}s at {}: {}",
        elapsed.as_secs_f64(),
        format_speed(length as f64 / elapsed.as_secs_f64().max(f64::EPSILON)),
        reply.trim(),
    );
    Ok(())
}
