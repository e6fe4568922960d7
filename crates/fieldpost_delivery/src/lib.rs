//! Device-side delivery of queued uploads.
//!
//! [`Outbox`] stages files and records them in the queue store. The
//! [`Scheduler`] decides when each item is attempted, holding at most one
//! dispatch per item and gating on [`Connectivity`]. A [`DeliveryWorker`]
//! performs one attempt and records its outcome as a queue state transition.

pub mod connectivity;
pub mod credentials;
pub mod outbox;
pub mod scheduler;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use connectivity::{run_probe, Connectivity, ConnectivitySubscription};
pub use credentials::{CredentialSource, FileCredentials, MemoryCredentials};
pub use outbox::{Outbox, StageRequest};
pub use scheduler::{Backoff, Scheduler, SchedulerConfig, SchedulerGuard, SweepMode};
pub use transport::{
    HttpUploadTransport, TransportError, TransportTimeouts, UploadReceipt, UploadRequest,
    UploadTransport,
};
pub use worker::{AttemptOutcome, DeliveryWorker};
