//! Error taxonomy for the ingress datapath.
//!
//! Every boundary in the datapath returns `Result<_, IngressError>` rather than
//! unwinding. Fatal kinds (initialization, verifier rejection, register-target
//! exhaustion) terminate only the component reporting them; transient kinds are
//! surfaced through statistics and do not stop a worker loop.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngressError {
    #[error("initialization failed for interface {interface}: {reason}")]
    InitializationFailure { interface: String, reason: String },

    #[error("xdp program rejected by verifier: {log}")]
    VerifierRejection { log: String },

    #[error("redirect-target map full (capacity {capacity}) registering queue {queue_id}")]
    RegisterTargetFull { capacity: usize, queue_id: u64 },

    #[error("transient ring condition on queue {queue_id}: {detail}")]
    RingTransient { queue_id: u64, detail: &'static str },

    #[error("destination port {port} has no configured flow class")]
    ClassificationUnknown { port: u16 },

    #[error("durable tier write failed for key {key}: {source}")]
    DurableIoFailure {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity mismatch for key {key}")]
    IntegrityMismatch { key: String },

    #[error("malformed packet: {reason}")]
    ParseMalformed { reason: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngressError>;
