use crate::worker::WorkerError;

pub(crate) type ByteCount = u64;

/// Form field under which files travel in upload requests, shared between the
/// `put` client and the `serve` handler.
pub(crate) const UPLOAD_FIELD_NAME: &str = "file";

/// Outcome of a single body read: where the bytes landed and whether the
/// sink accepted all of them.
#[derive(Debug)]
pub(crate) struct ChunkReport {
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) bytes_written: u64,
    pub(crate) write_error: Option<std::io::Error>,
}

/// Everything a worker tells the coordinator, multiplexed on one channel so
/// the aggregation loop stays a single exhaustive match.
#[derive(Debug)]
pub(crate) enum TransferUpdate {
    Progress(ChunkReport),
    /// Emitted exactly once per logical worker task, after its whole chain of
    /// owned and stolen ranges is finished.
    Done(Result<(), WorkerError>),
}
