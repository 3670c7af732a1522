use std::time::Duration;

use reqwest::Client;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Which HTTP version the workers should ride. The probe upgrades this to
/// `Http2` when the server already negotiated it, so every worker connection
/// skips the version dance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Http1,
    Http2,
}

/// Builds the client a worker (or the probe itself) talks through. Pooling
/// of idle connections is disabled: each worker holds one long-lived ranged
/// request and reconnects only on retry.
pub(crate) fn build_client(transport: Transport, insecure: bool) -> reqwest::Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(0);
    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if transport == Transport::Http2 {
        builder = builder.http2_prior_knowledge();
    }
    builder.build()
}

/// `Range` header value for the half-open span `[offset, end)`.
pub(crate) fn range_header(offset: u64, end: u64) -> String {
    format!("bytes={}-{}", offset, end - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_inclusive_on_the_wire() {
        assert_eq!(range_header(0, 100), "bytes=0-99");
        assert_eq!(range_header(250_000, 500_000), "bytes=250000-499999");
    }

    #[test]
    fn builds_clients_for_both_transports() {
        build_client(Transport::Http1, false).unwrap();
        build_client(Transport::Http2, true).unwrap();
    }
}
