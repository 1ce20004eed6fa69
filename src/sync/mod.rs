//! Background sync: a durable queue for submissions made while offline.
//!
//! Forms and uploads are accepted immediately, persisted to the tiered
//! store, and delivered when connectivity allows. Delivery failures back
//! off exponentially; items that exhaust their retry budget become dead
//! letters the host can inspect and requeue.

mod item;
mod queue;
mod transport;

pub use item::{
  retry_delay, DeadLetter, EnqueueReceipt, FilePayload, SubmitOptions, SyncItem, SyncKind,
  SyncPayload, FORM_TAG, UPLOAD_TAG,
};
pub use queue::{SyncQueue, SyncScheduler};
pub use transport::{HttpTransport, Transport};
