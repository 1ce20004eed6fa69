//! Lifecycle event bus and outward notification bus.
//!
//! The host application owns the ambient signals this subsystem reacts to
//! (connectivity changes, visibility changes, imminent shutdown, uncaught
//! errors). Rather than reading that state ambiently, every component
//! subscribes to an [`EventBus`] handed to it at construction, which keeps
//! the whole subsystem drivable from tests.
//!
//! Results flow the other way through the [`Notifier`]: delivery outcomes and
//! recovery offers are broadcast as [`Notification`]s for the host's toast or
//! status layer to render. Nothing in this crate blocks on a notification
//! being consumed.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::backup::SnapshotSummary;

/// Buffer size for both broadcast channels. Events are small and consumers
/// are expected to keep up; laggards lose the oldest events.
const CHANNEL_CAPACITY: usize = 64;

/// Ambient host signals the subsystem reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// Connectivity regained.
  Online,
  /// Connectivity lost.
  Offline,
  /// The host surface became invisible (window blurred, tab hidden).
  Hidden,
  /// The host is about to suspend or shut down.
  Suspend,
  /// The host caught an error it considers session-threatening.
  AppError,
}

/// Broadcast bus for [`LifecycleEvent`]s plus the current connectivity flag.
///
/// `emit` never blocks and never fails; events sent while nobody is
/// subscribed are dropped, matching how browser events behave when no
/// listener is attached.
pub struct EventBus {
  tx: broadcast::Sender<LifecycleEvent>,
  online: AtomicBool,
}

impl EventBus {
  /// Create a bus that assumes connectivity is initially present.
  pub fn new() -> Self {
    Self::with_connectivity(true)
  }

  /// Create a bus with an explicit initial connectivity state.
  pub fn with_connectivity(online: bool) -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self {
      tx,
      online: AtomicBool::new(online),
    }
  }

  /// Subscribe to lifecycle events. Each subscriber gets every event emitted
  /// after the subscription was created.
  pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
    self.tx.subscribe()
  }

  /// Emit an event to all subscribers, updating the connectivity flag for
  /// `Online`/`Offline`.
  pub fn emit(&self, event: LifecycleEvent) {
    match event {
      LifecycleEvent::Online => self.online.store(true, Ordering::SeqCst),
      LifecycleEvent::Offline => self.online.store(false, Ordering::SeqCst),
      _ => {}
    }
    // Ignore send errors - no subscriber means nothing to notify
    if self.tx.send(event).is_err() {
      debug!(?event, "lifecycle event had no subscribers");
    }
  }

  /// Current connectivity as of the last `Online`/`Offline` event.
  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}

/// Outcome messages emitted for the host UI to surface.
#[derive(Debug, Clone)]
pub enum Notification {
  /// A queued form post was delivered.
  SubmissionSuccess { id: Uuid, label: String },
  /// A queued form post exhausted its retry budget.
  SubmissionFailure { id: Uuid, label: String, attempts: u32 },
  /// A queued upload was delivered.
  UploadSuccess { id: Uuid, label: String },
  /// A queued upload exhausted its retry budget.
  UploadFailure { id: Uuid, label: String, attempts: u32 },
  /// Informational sync status ("saved offline", "retrying", ...).
  SyncMessage { message: String },
  /// Session snapshots worth restoring were found at startup.
  RecoveryAvailable { candidates: Vec<SnapshotSummary> },
  /// A snapshot was applied back onto the session.
  RecoveryRestored { id: Uuid },
}

/// Broadcast bus for [`Notification`]s.
pub struct Notifier {
  tx: broadcast::Sender<Notification>,
}

impl Notifier {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self { tx }
  }

  /// Subscribe to notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.tx.subscribe()
  }

  /// Emit a notification; never blocks, never fails.
  pub fn emit(&self, notification: Notification) {
    let _ = self.tx.send(notification);
  }
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_connectivity_tracks_events() {
    let bus = EventBus::new();
    assert!(bus.is_online());

    bus.emit(LifecycleEvent::Offline);
    assert!(!bus.is_online());

    bus.emit(LifecycleEvent::Online);
    assert!(bus.is_online());
  }

  #[tokio::test]
  async fn test_subscribers_receive_events() {
    let bus = EventBus::new();
    let mut rx = bus.subscribe();

    bus.emit(LifecycleEvent::Hidden);
    bus.emit(LifecycleEvent::Suspend);

    assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::Hidden);
    assert_eq!(rx.recv().await.unwrap(), LifecycleEvent::Suspend);
  }

  #[tokio::test]
  async fn test_emit_without_subscribers_is_harmless() {
    let bus = EventBus::with_connectivity(false);
    bus.emit(LifecycleEvent::Online);
    assert!(bus.is_online());
  }

  #[tokio::test]
  async fn test_notifier_round_trip() {
    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();

    notifier.emit(Notification::SyncMessage {
      message: "saved offline".to_string(),
    });

    match rx.recv().await.unwrap() {
      Notification::SyncMessage { message } => assert_eq!(message, "saved offline"),
      other => panic!("unexpected notification: {other:?}"),
    }
  }
}
