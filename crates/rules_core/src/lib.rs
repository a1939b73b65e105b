use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{RouteRule, RuleId},
    events::RuleChange,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod bus;
pub mod manager;
mod rule_store;
pub mod undo;
pub use rule_store::DurableRuleStore;

use bus::ChangeBus;

const DEFAULT_RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);
const DEFAULT_VIEW_EVENT_CAPACITY: usize = 64;

/// Tunables for [`RuleListEngine`]. The defaults match interactive use; tests
/// shorten the debounce to keep the clock moving.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reload_debounce: Duration,
    pub view_event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reload_debounce: DEFAULT_RELOAD_DEBOUNCE,
            view_event_capacity: DEFAULT_VIEW_EVENT_CAPACITY,
        }
    }
}

/// Granular notifications for whatever renders the list. Positions are view
/// positions: 0 is the pinned help entry, rules start at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    Inserted { position: usize },
    Removed { position: usize },
    Changed { position: usize },
    Moved { from: usize, to: usize },
    Reset,
    UndoPrompt { pending: usize },
    StoreNotice { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Applied,
    /// A newer reload finished first; this result was discarded.
    Superseded,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("rule store unavailable: {source}")]
    StoreUnavailable { source: anyhow::Error },
    #[error("position 0 is the pinned help entry")]
    PinnedPosition,
    #[error("position {position} is out of range for {len} entries")]
    OutOfRange { position: usize, len: usize },
}

/// Persistence seam consumed by [`RuleListEngine`] and
/// [`manager::RuleManager`]. [`DurableRuleStore`] is the SQLite-backed
/// implementation; tests substitute in-memory doubles.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_ordered(&self) -> Result<Vec<RouteRule>>;
    async fn insert(&self, rule: &RouteRule) -> Result<RuleId>;
    async fn next_user_order(&self) -> Result<i64>;
    async fn upsert_one(&self, rule: &RouteRule) -> Result<()>;
    async fn upsert_batch(&self, rules: &[RouteRule]) -> Result<()>;
    async fn delete_batch(&self, ids: &[RuleId]) -> Result<u64>;
    async fn delete_all(&self) -> Result<u64>;
}

/// In-memory mirror of the rule table, kept in listing order and reconciled
/// against the change bus. One instance per open listing; all instances share
/// the store and the bus.
pub struct RuleListEngine {
    store: Arc<dyn RuleStore>,
    bus: ChangeBus,
    config: EngineConfig,
    inner: Mutex<ListState>,
    reloads_started: AtomicU64,
    events: broadcast::Sender<ViewEvent>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
}

struct ListState {
    rules: Vec<RouteRule>,
    pending_reorder: HashMap<RuleId, RouteRule>,
    applied_generation: u64,
}

impl RuleListEngine {
    pub fn new(store: Arc<dyn RuleStore>, bus: ChangeBus) -> Arc<Self> {
        Self::with_config(store, bus, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn RuleStore>,
        bus: ChangeBus,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.view_event_capacity);
        Arc::new(Self {
            store,
            bus,
            config,
            inner: Mutex::new(ListState {
                rules: Vec::new(),
                pending_reorder: HashMap::new(),
                applied_generation: 0,
            }),
            reloads_started: AtomicU64::new(0),
            events,
            reconcile_task: Mutex::new(None),
            debounce_task: Mutex::new(None),
        })
    }

    /// Subscribes to the change bus, spawns the reconcile task and performs
    /// the initial load.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let receiver = self.bus.subscribe();
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            engine.run_reconcile(receiver).await;
        });
        {
            let mut slot = self.reconcile_task.lock().await;
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }

        self.reload().await?;
        Ok(())
    }

    /// Aborts the reconcile and debounce tasks. Dropping the bus receiver
    /// inside the reconcile task is what unsubscribes this instance.
    pub async fn shutdown(&self) {
        if let Some(task) = self.reconcile_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.debounce_task.lock().await.take() {
            task.abort();
        }
    }

    pub fn subscribe_view_events(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }

    /// Sender half of the view-event stream, for components that feed the
    /// same view (the undo controller posts its prompts here).
    pub fn view_event_sender(&self) -> broadcast::Sender<ViewEvent> {
        self.events.clone()
    }

    pub async fn rules(&self) -> Vec<RouteRule> {
        self.inner.lock().await.rules.clone()
    }

    pub async fn rule_at(&self, position: usize) -> Option<RouteRule> {
        if position == 0 {
            return None;
        }
        self.inner.lock().await.rules.get(position - 1).cloned()
    }

    /// Number of view entries, the pinned help entry included.
    pub async fn entry_count(&self) -> usize {
        self.inner.lock().await.rules.len() + 1
    }

    /// True while reorder keys changed by drags are still waiting for
    /// [`Self::commit_move`].
    pub async fn has_unsaved_reorder(&self) -> bool {
        !self.inner.lock().await.pending_reorder.is_empty()
    }

    /// Replaces the sequence with a fresh listing from the store. Each reload
    /// takes a generation number when it starts; a result only applies while
    /// no newer reload has applied yet, so overlapping reloads resolve to
    /// last-writer-wins.
    pub async fn reload(&self) -> Result<ReloadOutcome, EngineError> {
        let generation = self.reloads_started.fetch_add(1, Ordering::SeqCst) + 1;
        let rules = self
            .store
            .list_ordered()
            .await
            .map_err(|source| EngineError::StoreUnavailable { source })?;

        let mut guard = self.inner.lock().await;
        if generation <= guard.applied_generation {
            debug!(
                generation,
                applied = guard.applied_generation,
                "discarding superseded reload"
            );
            return Ok(ReloadOutcome::Superseded);
        }

        guard.applied_generation = generation;
        guard.rules = rules;
        let _ = self.events.send(ViewEvent::Reset);
        Ok(ReloadOutcome::Applied)
    }

    /// Moves the rule at view position `from` to view position `to` by
    /// rotating the manual sort keys across the affected span: each displaced
    /// rule inherits the key its neighbor vacated and the dragged rule takes
    /// the last freed key. The key multiset is preserved and rules outside
    /// the span keep their keys, so the store never needs a full renumbering.
    ///
    /// Nothing is persisted here; every touched rule joins the pending
    /// reorder set until [`Self::commit_move`] flushes it.
    pub async fn move_rule(&self, from: usize, to: usize) -> Result<(), EngineError> {
        let mut guard = self.inner.lock().await;
        let len = guard.rules.len();
        check_position(from, len)?;
        check_position(to, len)?;
        if from == to {
            return Ok(());
        }

        let low = from.min(to) - 1;
        let high = from.max(to) - 1;
        let source = from - 1;
        let target = to - 1;

        let mut moved = guard.rules.remove(source);
        let mut freed = moved.user_order;
        if source < target {
            // after the removal the displaced rules occupy source..target
            for rule in guard.rules[source..target].iter_mut() {
                std::mem::swap(&mut freed, &mut rule.user_order);
            }
        } else {
            for rule in guard.rules[target..source].iter_mut().rev() {
                std::mem::swap(&mut freed, &mut rule.user_order);
            }
        }
        moved.user_order = freed;
        guard.rules.insert(target, moved);

        let state = &mut *guard;
        for rule in &state.rules[low..=high] {
            state.pending_reorder.insert(rule.id, rule.clone());
        }
        let _ = self.events.send(ViewEvent::Moved { from, to });
        Ok(())
    }

    /// Flushes the pending reorder set as one atomic batch, announces the
    /// updates on the bus and reloads. With nothing pending this returns
    /// without touching the store. On store failure the pending set and the
    /// in-memory order are kept so the flush can be retried. Entries the
    /// flush settled leave the pending set; entries re-touched by another
    /// drag in the meantime stay pending for the next flush.
    pub async fn commit_move(&self) -> Result<(), EngineError> {
        let batch: Vec<RouteRule> = {
            let guard = self.inner.lock().await;
            if guard.pending_reorder.is_empty() {
                return Ok(());
            }
            let mut batch: Vec<RouteRule> = guard.pending_reorder.values().cloned().collect();
            batch.sort_by_key(|rule| rule.user_order);
            batch
        };

        self.store
            .upsert_batch(&batch)
            .await
            .map_err(|source| EngineError::StoreUnavailable { source })?;

        {
            let mut guard = self.inner.lock().await;
            for rule in &batch {
                // a drag may have re-touched the rule while the flush was in
                // flight; only entries matching what was written are settled
                if guard.pending_reorder.get(&rule.id) == Some(rule) {
                    guard.pending_reorder.remove(&rule.id);
                }
            }
        }

        info!(flushed = batch.len(), "committed reorder batch");
        for rule in batch {
            self.bus.publish(RuleChange::Updated { rule });
        }

        self.reload().await?;
        Ok(())
    }

    /// Takes the rule at `position` out of the sequence without touching the
    /// store. The returned pair is what the undo controller records; the
    /// matching hard delete only happens when the undo window closes.
    pub async fn remove(&self, position: usize) -> Result<(usize, RouteRule), EngineError> {
        let mut guard = self.inner.lock().await;
        check_position(position, guard.rules.len())?;

        let rule = guard.rules.remove(position - 1);
        let _ = self.events.send(ViewEvent::Removed { position });
        Ok((position, rule))
    }

    /// Puts removed rules back at their recorded view positions. Positions
    /// past the current tail are clamped to the tail, so restoring is always
    /// possible even after concurrent removals.
    pub async fn restore(&self, entries: Vec<(usize, RouteRule)>) {
        let mut guard = self.inner.lock().await;
        for (position, rule) in entries {
            let index = position.saturating_sub(1).min(guard.rules.len());
            guard.rules.insert(index, rule);
            let _ = self.events.send(ViewEvent::Inserted {
                position: index + 1,
            });
        }
    }

    /// Persists a new enabled flag for the rule at `position`, then applies
    /// it locally and announces the update. The sequence stays untouched when
    /// the store write fails.
    pub async fn set_enabled(
        self: &Arc<Self>,
        position: usize,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let mut rule = {
            let guard = self.inner.lock().await;
            check_position(position, guard.rules.len())?;
            guard.rules[position - 1].clone()
        };
        if rule.enabled == enabled {
            return Ok(());
        }
        rule.enabled = enabled;

        self.store
            .upsert_one(&rule)
            .await
            .map_err(|source| EngineError::StoreUnavailable { source })?;

        {
            let mut guard = self.inner.lock().await;
            // the rule may have shifted while the store write was in flight
            if let Some(index) = guard.rules.iter().position(|r| r.id == rule.id) {
                guard.rules[index] = rule.clone();
                let _ = self.events.send(ViewEvent::Changed {
                    position: index + 1,
                });
            }
        }

        self.bus.publish(RuleChange::Updated { rule });
        self.schedule_reload().await;
        Ok(())
    }

    /// Applies one change-bus notification to the sequence. Changes are
    /// idempotent against local state: an `Added` for a rule already present
    /// degrades to an update, `Updated`/`Removed` for unknown rules are
    /// logged and left for the reload to settle. Every notification also
    /// schedules the debounced full reload.
    pub async fn apply_change(self: &Arc<Self>, change: RuleChange) {
        {
            let mut guard = self.inner.lock().await;
            match change {
                RuleChange::Added { rule } => {
                    if let Some(index) = guard.rules.iter().position(|r| r.id == rule.id) {
                        guard.rules[index] = rule;
                        let _ = self.events.send(ViewEvent::Changed {
                            position: index + 1,
                        });
                    } else {
                        guard.rules.push(rule);
                        let position = guard.rules.len();
                        let _ = self.events.send(ViewEvent::Inserted { position });
                    }
                }
                RuleChange::Updated { rule } => {
                    if let Some(index) = guard.rules.iter().position(|r| r.id == rule.id) {
                        guard.rules[index] = rule;
                        let _ = self.events.send(ViewEvent::Changed {
                            position: index + 1,
                        });
                    } else {
                        debug!(rule_id = rule.id.0, "update for unknown rule");
                    }
                }
                RuleChange::Removed { id } => {
                    if let Some(index) = guard.rules.iter().position(|r| r.id == id) {
                        guard.rules.remove(index);
                        let _ = self.events.send(ViewEvent::Removed {
                            position: index + 1,
                        });
                    } else {
                        debug!(rule_id = id.0, "removal for unknown rule");
                    }
                }
                RuleChange::Cleared => {
                    guard.rules.clear();
                    guard.pending_reorder.clear();
                    let _ = self.events.send(ViewEvent::Reset);
                }
            }
        }

        self.schedule_reload().await;
    }

    async fn run_reconcile(self: Arc<Self>, mut receiver: broadcast::Receiver<RuleChange>) {
        loop {
            match receiver.recv().await {
                Ok(change) => self.apply_change(change).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change bus lagged, forcing reload");
                    self.schedule_reload().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Debounced reload: each call cancels the previous timer and starts a
    /// fresh one, so a burst of changes collapses into a single listing.
    async fn schedule_reload(self: &Arc<Self>) {
        let mut slot = self.debounce_task.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let engine = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(engine.config.reload_debounce).await;
            if let Err(err) = engine.reload().await {
                warn!(error = %err, "debounced reload failed");
                let _ = engine.events.send(ViewEvent::StoreNotice {
                    message: format!("reload failed: {err}"),
                });
            }
        }));
    }
}

fn check_position(position: usize, rules_len: usize) -> Result<(), EngineError> {
    if position == 0 {
        return Err(EngineError::PinnedPosition);
    }
    if position > rules_len {
        return Err(EngineError::OutOfRange {
            position,
            len: rules_len + 1,
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
