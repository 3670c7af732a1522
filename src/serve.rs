use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use log::info;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tower_http::services::ServeDir;

use crate::types::UPLOAD_FIELD_NAME;

#[derive(Error, Debug)]
pub(crate) enum ServeError {
    #[error("binding {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("server error: {0}")]
    Serve(#[from] io::Error),
}

#[derive(Clone)]
struct ServeState {
    root: Arc<PathBuf>,
}

/// Serves `root` over HTTP: `POST /upload` accepts multipart uploads into
/// the directory, everything else is static file service of its contents.
pub(crate) async fn serve(listen: SocketAddr, root: PathBuf) -> Result<(), ServeError> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|source| ServeError::Bind {
            addr: listen,
            source,
        })?;
    info!("serving {} at http://{listen}/", root.display());
    axum::serve(listener, app(root)).await?;
    Ok(())
}

fn app(root: PathBuf) -> Router {
    Router::new()
        .route("/upload", post(receive_upload))
        .fallback_service(ServeDir::new(root.clone()))
        .layer(DefaultBodyLimit::disable())
        .with_state(ServeState {
            root: Arc::new(root),
        })
}

async fn receive_upload(
    State(state): State<ServeState>,
    mut multipart: Multipart,
) -> Result<String, (StatusCode, String)> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() != Some(UPLOAD_FIELD_NAME) {
            continue;
        }
        let name = field
            .file_name()
            .map(sanitize_file_name)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, "missing file name".to_owned()))?;
        let received = store_field(&state.root, &name, &mut field)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        info!("received {received} bytes into {name}");
        return Ok(format!("stored {name} ({received} bytes)\n"));
    }
    Err((
        StatusCode::BAD_REQUEST,
        format!("no {UPLOAD_FIELD_NAME} field in form"),
    ))
}

/// Uploads land under their final path component only, so a crafted file
/// name cannot escape the serve root.
fn sanitize_file_name(raw: &str) -> String {
    Path::new(raw)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_owned())
}

/// Streams the part into `.{name}~` and renames into place once complete,
/// so downloads never observe a half-written file.
async fn store_field(root: &Path, name: &str, field: &mut Field<'_>) -> io::Result<u64> {
    let staging = root.join(format!(".{name}~"));
    let mut file = tokio::fs::File::create(&staging).await?;
    let mut received = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    {
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
    }
    file.flush().await?;
    tokio::fs::rename(&staging, root.join(name)).await?;
    Ok(received)
}
