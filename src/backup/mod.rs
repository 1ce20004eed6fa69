//! Session backup and crash recovery.
//!
//! The manager snapshots ambient session state (form values, navigation,
//! scroll, preferences) on a timer and on lifecycle triggers, persists the
//! snapshots through the tiered store, and on the next start offers the
//! most relevant one back to the host. Credential-looking fields never
//! reach a persisted snapshot.

mod manager;
mod snapshot;

pub use manager::{BackupExport, BackupManager, BackupReceipt};
pub use snapshot::{
  BackupScope, BackupTrigger, FieldRef, NavState, SensitiveFieldFilter, SessionSink,
  SessionSource, SessionState, Snapshot, SnapshotSummary,
};
