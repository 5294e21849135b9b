//! Cluster bus plumbing: envelopes, outbound queue, reply correlation

pub mod correlate;
pub mod envelope;
pub mod message;
pub mod outbox;

pub use correlate::{CorrelationTable, Disposition, Waiter};
pub use envelope::{
    open, seal, DaemonKind, Envelope, EnvelopeError, HostSpec, Sender, COMPRESS_THRESHOLD,
    MAX_ENVELOPE_SIZE,
};
pub use message::ClusterMsg;
pub use outbox::{
    BusError, FlushOutcome, Outbox, CONNECT_RETRY_LIMIT, MAX_FLUSH_DELAY_MS, QUEUE_ERROR,
    QUEUE_WARN, SEND_RETRY_LIMIT,
};
