//! Vigil host: telemetry ingestion and command dispatch over TCP.
//!
//! Remote agents each hold one persistent connection, streaming hardware
//! telemetry (CPU, RAM, disk, network, temperature) as newline-delimited
//! JSON. The host decodes each report, tracks which device identity is live
//! on which connection, hands records to a pluggable persistence sink, and
//! routes operator commands (remote shutdown) back to one agent or to all
//! of them.

pub mod config;
pub mod dispatch;
pub mod registry;
pub mod server;
pub mod session;
pub mod sink;
pub mod wire;

pub use config::{load_config, HostConfig};
pub use dispatch::{CommandDispatcher, DispatchError};
pub use registry::DeviceRegistry;
pub use server::IngestionServer;
pub use session::{Session, SessionError, SessionSet};
pub use sink::{AuditEntry, LogSink, MemorySink, StoredRecord, TelemetrySink};
pub use wire::{CommandFrame, DecodeError, Frame, TelemetryRecord};
