use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::domain::{RouteRule, RuleId};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::warn;

use crate::{manager::RuleManager, RuleListEngine, ViewEvent};

const DEFAULT_UNDO_WINDOW: Duration = Duration::from_secs(5);

/// What the undo controller does with a pending batch: put it back, or make
/// the removal durable.
#[async_trait]
pub trait UndoHandler<T>: Send + Sync {
    async fn restore(&self, entries: Vec<(usize, T)>);
    async fn finalize(&self, entries: Vec<(usize, T)>) -> anyhow::Result<()>;
}

/// Collects removals into a single undoable batch. Each removal extends the
/// batch and restarts the finalize window; when the window lapses (or the
/// batch is committed explicitly) the whole batch is finalized at once.
///
/// The batch is handed out with take-semantics, so a batch is either
/// restored or finalized, exactly once, never both.
pub struct UndoController<T: Send + 'static> {
    handler: Arc<dyn UndoHandler<T>>,
    events: broadcast::Sender<ViewEvent>,
    window: Duration,
    pending: Mutex<Vec<(usize, T)>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> UndoController<T> {
    pub fn new(
        handler: Arc<dyn UndoHandler<T>>,
        events: broadcast::Sender<ViewEvent>,
    ) -> Arc<Self> {
        Self::with_window(handler, events, DEFAULT_UNDO_WINDOW)
    }

    pub fn with_window(
        handler: Arc<dyn UndoHandler<T>>,
        events: broadcast::Sender<ViewEvent>,
        window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler,
            events,
            window,
            pending: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
        })
    }

    /// Records one removal, restarts the finalize window and refreshes the
    /// undo prompt with the current batch size.
    pub async fn remove(self: &Arc<Self>, position: usize, entity: T) {
        let pending = {
            let mut guard = self.pending.lock().await;
            guard.push((position, entity));
            guard.len()
        };
        self.restart_timer().await;
        let _ = self.events.send(ViewEvent::UndoPrompt { pending });
    }

    /// Restores the whole pending batch, most recent removal first, so each
    /// entry goes back to the position recorded for it.
    pub async fn undo(&self) {
        self.cancel_timer().await;
        let mut batch = {
            let mut guard = self.pending.lock().await;
            std::mem::take(&mut *guard)
        };
        if batch.is_empty() {
            return;
        }

        batch.reverse();
        self.handler.restore(batch).await;
    }

    /// Finalizes the pending batch now instead of waiting for the window.
    pub async fn commit(&self) {
        self.cancel_timer().await;
        self.finalize_pending().await;
    }

    /// Teardown path: commit whatever is still pending before the view goes
    /// away.
    pub async fn flush(&self) {
        self.commit().await;
    }

    async fn finalize_pending(&self) {
        let batch = {
            let mut guard = self.pending.lock().await;
            std::mem::take(&mut *guard)
        };
        if batch.is_empty() {
            return;
        }

        if let Err(err) = self.handler.finalize(batch).await {
            // the rows were never deleted, the next reload brings them back
            warn!(error = %err, "finalizing removals failed");
            let _ = self.events.send(ViewEvent::StoreNotice {
                message: format!("delete failed: {err}"),
            });
        }
    }

    async fn restart_timer(self: &Arc<Self>) {
        let mut slot = self.timer.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let controller = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(controller.window).await;
            controller.finalize_pending().await;
        }));
    }

    async fn cancel_timer(&self) {
        let mut slot = self.timer.lock().await;
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

/// Production wiring: restore puts rules back into the listing, finalize
/// hard-deletes them through the manager so the removal fans out to every
/// instance.
pub struct RuleUndoHandler {
    engine: Arc<RuleListEngine>,
    manager: RuleManager,
}

impl RuleUndoHandler {
    pub fn new(engine: Arc<RuleListEngine>, manager: RuleManager) -> Arc<Self> {
        Arc::new(Self { engine, manager })
    }
}

#[async_trait]
impl UndoHandler<RouteRule> for RuleUndoHandler {
    async fn restore(&self, entries: Vec<(usize, RouteRule)>) {
        self.engine.restore(entries).await;
    }

    async fn finalize(&self, entries: Vec<(usize, RouteRule)>) -> anyhow::Result<()> {
        let ids: Vec<RuleId> = entries.iter().map(|(_, rule)| rule.id).collect();
        self.manager.delete_rules(&ids).await
    }
}

#[cfg(test)]
#[path = "tests/undo_tests.rs"]
mod tests;
