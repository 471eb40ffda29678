//! Live query subscriptions and their per-view lifetimes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::store::{Document, DocumentStore, Query};

/// Screens that own live subscriptions. Switching views tears down the
/// previous view's handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    Home,
    Competitions,
    Students,
    Grading,
    Parent,
}

/// Handle to a running snapshot listener. Dropping it stops the listener.
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Delivers the documents matching `query` once, then again after every
/// write to the query's collection.
pub fn on_snapshot<F>(store: Arc<dyn DocumentStore>, query: Query, callback: F) -> Subscription
where
    F: Fn(Vec<Document>) + Send + Sync + 'static,
{
    // Subscribe before the first fetch so no write slips between the two.
    let mut changes = store.changes();

    let task = tokio::spawn(async move {
        let mut pending = true;
        loop {
            if pending {
                match store.get_docs(&query).await {
                    Ok(docs) => callback(docs),
                    Err(err) => {
                        error!(collection = %query.collection, error = %err, "snapshot fetch failed")
                    }
                }
            }

            pending = match changes.recv().await {
                Ok(changed) => changed == query.collection,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(collection = %query.collection, skipped, "change feed lagged, refetching");
                    true
                }
                Err(RecvError::Closed) => {
                    debug!(collection = %query.collection, "change feed closed");
                    break;
                }
            };
        }
    });

    Subscription { task }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    views: HashMap<View, Vec<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the handles for `view`, first tearing down whatever the view
    /// held before.
    pub fn replace(&mut self, view: View, subscriptions: Vec<Subscription>) {
        self.teardown(view);
        if !subscriptions.is_empty() {
            self.views.insert(view, subscriptions);
        }
    }

    pub fn teardown(&mut self, view: View) -> usize {
        let removed = self.views.remove(&view).map_or(0, |subs| subs.len());
        if removed > 0 {
            debug!(?view, removed, "subscriptions torn down");
        }
        removed
    }

    /// Drops every live handle, as on logout.
    pub fn teardown_all(&mut self) -> usize {
        let removed = self.views.drain().map(|(_, subs)| subs.len()).sum();
        debug!(removed, "all subscriptions torn down");
        removed
    }

    pub fn active(&self, view: View) -> usize {
        self.views.get(&view).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{collection, encode, query, Op, GROUPS, STUDENTS};

    const WAIT: Duration = Duration::from_secs(2);

    fn watch(
        store: &Arc<dyn DocumentStore>,
        query: Query,
    ) -> (Subscription, mpsc::UnboundedReceiver<usize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = on_snapshot(store.clone(), query, move |docs| {
            let _ = tx.send(docs.len());
        });
        (sub, rx)
    }

    #[tokio::test]
    async fn snapshot_refires_on_matching_writes_only() -> anyhow::Result<()> {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let students = query(&collection(STUDENTS)).filter("level", Op::Eq, "middle");
        let (_sub, mut rx) = watch(&store, students);

        assert_eq!(timeout(WAIT, rx.recv()).await?, Some(0));

        store
            .add_doc(&collection(GROUPS), encode(&json!({ "name": "Falcons" }))?)
            .await?;
        store
            .add_doc(
                &collection(STUDENTS),
                encode(&json!({ "name": "Omar", "level": "middle" }))?,
            )
            .await?;

        // The group write is ignored; the student write refetches.
        assert_eq!(timeout(WAIT, rx.recv()).await?, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivering() -> anyhow::Result<()> {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let (sub, mut rx) = watch(&store, query(&collection(STUDENTS)));
        assert_eq!(timeout(WAIT, rx.recv()).await?, Some(0));

        sub.unsubscribe();
        store
            .add_doc(&collection(STUDENTS), encode(&json!({ "name": "Omar" }))?)
            .await?;

        // The aborted task drops its sender, closing the channel.
        assert_eq!(timeout(WAIT, rx.recv()).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn registry_replaces_and_tears_down_per_view() -> anyhow::Result<()> {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let mut registry = SubscriptionRegistry::new();

        let (home, mut home_rx) = watch(&store, query(&collection(STUDENTS)));
        let (grading, _grading_rx) = watch(&store, query(&collection(GROUPS)));
        registry.replace(View::Home, vec![home]);
        registry.replace(View::Grading, vec![grading]);
        assert_eq!(timeout(WAIT, home_rx.recv()).await?, Some(0));

        let (replacement, _replacement_rx) = watch(&store, query(&collection(STUDENTS)));
        registry.replace(View::Home, vec![replacement]);
        assert_eq!(registry.active(View::Home), 1);
        // The replaced handle was aborted.
        assert_eq!(timeout(WAIT, home_rx.recv()).await?, None);

        assert_eq!(registry.teardown(View::Parent), 0);
        assert_eq!(registry.teardown_all(), 2);
        assert_eq!(registry.active(View::Grading), 0);
        Ok(())
    }
}
