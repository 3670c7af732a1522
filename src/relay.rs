use std::io;
use std::str::FromStr;

use log::{info, warn};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

#[derive(Error, Debug)]
pub(crate) enum RelayError {
    #[error("invalid relay mapping {0:?}, expected LOCALPORT:HOST:PORT")]
    InvalidMapping(String),
    #[error("binding port {port}: {source}")]
    Bind { port: u16, source: io::Error },
}

/// One port mapping: connections accepted on `local_port` are piped to
/// `target` (a `host:port` pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RelayMapping {
    pub(crate) local_port: u16,
    pub(crate) target: String,
}

impl FromStr for RelayMapping {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RelayError::InvalidMapping(s.to_owned());
        let (port, target) = s.split_once(':').ok_or_else(invalid)?;
        let local_port = port.parse().map_err(|_| invalid())?;
        let (host, target_port) = target.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || target_port.parse::<u16>().is_err() {
            return Err(invalid());
        }
        Ok(Self {
            local_port,
            target: target.to_owned(),
        })
    }
}

/// Binds every mapping up front (so a bad one fails the whole command), then
/// forwards connections until the process is stopped.
pub(crate) async fn run_relays(mappings: Vec<RelayMapping>) -> Result<(), RelayError> {
    let mut listeners = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let listener = TcpListener::bind(("0.0.0.0", mapping.local_port))
            .await
            .map_err(|source| RelayError::Bind {
                port: mapping.local_port,
                source,
            })?;
        info!("relaying port {} to {}", mapping.local_port, mapping.target);
        listeners.push((listener, mapping.target));
    }

    let tasks: Vec<_> = listeners
        .into_iter()
        .map(|(listener, target)| tokio::spawn(accept_loop(listener, target)))
        .collect();
    futures::future::join_all(tasks).await;
    Ok(())
}

async fn accept_loop(listener: TcpListener, target: String) {
    loop {
        match listener.accept().await {
            Ok((inbound, peer)) => {
                let target = target.clone();
                tokio::spawn(async move {
                    if let Err(e) = forward(inbound, &target).await {
                        warn!("relay connection from {peer} failed: {e}");
                    }
                });
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
}

async fn forward(mut inbound: TcpStream, target: &str) -> io::Result<()> {
    let mut outbound = TcpStream::connect(target).await?;
    tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    Ok(())
}
