//! `fieldops-client`
//!
//! **Responsibility:** offline-resilient job closure on the technician's device.
//!
//! This crate provides:
//! - A durable outbox for closures submitted without connectivity
//! - The geofence gate and image reconciliation used by the closure form
//! - The closure orchestrator (immediate commit or deferred enqueue)
//! - The sync engine and worker that replay queued closures on reconnect
//!
//! The backend stays the system of record; the client only ever consumes
//! parts, records expenses and writes closure updates.

pub mod backend;
pub mod closure;
pub mod config;
pub mod connectivity;
pub mod form;
pub mod geofence;
pub mod images;
pub mod notify;
pub mod outbox;
pub mod sync_engine;
pub mod sync_worker;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use backend::{Backend, BackendError, BackendErrorKind, HttpBackend, HttpBackendConfig, ObjectStorage};
pub use closure::{ClosureError, ClosureOrchestrator, ClosureOutcome, ClosureRequest};
pub use config::ClientConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use form::{ClosureForm, CostAdvisor, CostAdvisory, PartAdmission};
pub use geofence::{GeoPoint, Geolocator, GeofenceResult, GeofenceStatus, LocationError, PositionProvider};
pub use images::{ImageError, ImageFile, ImageUploader};
pub use notify::{ChannelNotifier, LogNotifier, Notice, Notifier};
pub use outbox::{InMemoryOutbox, OutboxError, OutboxStore, SqliteOutbox};
pub use sync_engine::{DrainReport, SyncEngine, SyncError};
pub use sync_worker::SyncWorker;
pub use types::{ClosurePayload, ExpenseEntry, MAX_RETRIES, PendingClosure};
