//! Fire-and-forget notification dispatch.
//!
//! Lifecycle transitions and level promotions are pushed to an external
//! collaborator off the critical path: the emitting operation sends into an
//! unbounded channel and returns; a dedicated worker thread drains the
//! channel into the caller-supplied sink. A failing sink is logged and never
//! rolls back the committed state change.

use crossbeam_channel::{unbounded, Sender};
use std::thread;
use uuid::Uuid;

use crate::model::IbStatus;

/// Events pushed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IbEvent {
    LifecycleChanged {
        partner: Uuid,
        from: IbStatus,
        to: IbStatus,
    },
    LevelPromoted {
        partner: Uuid,
        level: Uuid,
    },
}

/// External delivery collaborator (mail, webhook, message bus).
pub trait NotificationSink: Send + 'static {
    fn deliver(&self, event: IbEvent) -> Result<(), String>;
}

/// Handle for emitting events. Cloneable; all clones feed the same worker.
/// When the last clone drops, the channel closes and the worker exits after
/// draining what remains.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Option<Sender<IbEvent>>,
}

impl Notifier {
    /// Spawn the worker thread draining into `sink`.
    pub fn new(sink: Box<dyn NotificationSink>) -> Self {
        let (tx, rx) = unbounded::<IbEvent>();
        let builder = thread::Builder::new().name("ibnet-notify".to_string());
        let spawned = builder.spawn(move || {
            for event in rx {
                if let Err(e) = sink.deliver(event.clone()) {
                    log::warn!("notification delivery failed for {event:?}: {e}");
                }
            }
        });
        if let Err(e) = spawned {
            log::warn!("could not spawn notification worker, events will be dropped: {e}");
            return Self { tx: None };
        }
        Self { tx: Some(tx) }
    }

    /// A notifier that drops every event; for tests and headless runs.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue an event. Never blocks and never fails the caller.
    pub fn emit(&self, event: IbEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
