use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connection::ClientConnection;
use crate::error::BackplaneError;

/// Connections currently interested in one subject. Shared with the
/// subject's delivery task, which snapshots it per incoming message.
pub type SubjectMembers = Arc<RwLock<Vec<Arc<ClientConnection>>>>;

struct SubjectEntry {
    members: SubjectMembers,
    task: JoinHandle<()>,
}

/// Reference-counted local interest for one routing category (connections,
/// groups, or users).
///
/// A subject owns exactly one underlying bus subscription while interest is
/// non-zero. One gate per registry instance serializes add/remove including
/// the first-interest subscribe call, so a subject can never be subscribed
/// twice concurrently. Serialization is deliberately per-category, not
/// per-subject: membership churn is not the throughput-critical path.
pub struct SubscriptionRegistry {
    category: &'static str,
    entries: Mutex<HashMap<String, SubjectEntry>>,
}

impl SubscriptionRegistry {
    pub fn new(category: &'static str) -> Self {
        Self {
            category,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register `conn`'s interest in `subject`. On first interest the
    /// caller-supplied `subscribe` opens the bus subscription and returns the
    /// delivery task that owns it. A connection appears at most once per
    /// subject; a connection that is already going away is skipped.
    ///
    /// A failed subscribe leaves no entry behind.
    pub async fn add_interest<F, Fut>(
        &self,
        subject: &str,
        conn: &Arc<ClientConnection>,
        subscribe: F,
    ) -> Result<(), BackplaneError>
    where
        F: FnOnce(SubjectMembers) -> Fut,
        Fut: Future<Output = Result<JoinHandle<()>, BackplaneError>>,
    {
        let mut entries = self.entries.lock().await;

        // Checked under the gate so it cannot race disconnect teardown.
        if conn.is_aborted() {
            tracing::debug!(
                category = self.category,
                subject,
                connection_id = %conn.id(),
                "skipping subscription for aborted connection"
            );
            return Ok(());
        }

        if let Some(entry) = entries.get(subject) {
            let mut members = entry.members.write();
            if !members.iter().any(|m| m.id() == conn.id()) {
                members.push(Arc::clone(conn));
            }
            return Ok(());
        }

        let members: SubjectMembers = Arc::new(RwLock::new(vec![Arc::clone(conn)]));
        let task = match subscribe(Arc::clone(&members)).await {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(
                    category = self.category,
                    subject,
                    error = %err,
                    "opening bus subscription failed"
                );
                return Err(err);
            }
        };
        entries.insert(subject.to_owned(), SubjectEntry { members, task });
        Ok(())
    }

    /// Deregister `conn`'s interest in `subject`. When no interest remains
    /// the delivery task is stopped and the bus subscription dropped; this
    /// does not return until the teardown is complete.
    pub async fn remove_interest(&self, subject: &str, conn: &ClientConnection) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(subject) else {
            return;
        };

        let remaining = {
            let mut members = entry.members.write();
            if let Some(pos) = members.iter().position(|m| m.id() == conn.id()) {
                members.remove(pos);
            }
            members.len()
        };

        if remaining == 0 {
            if let Some(entry) = entries.remove(subject) {
                entry.task.abort();
                let _ = entry.task.await;
            }
        }
    }

    /// Tear down every subject. Used on coordinator shutdown.
    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            entry.task.abort();
            let _ = entry.task.await;
        }
    }

    /// Number of subjects with live interest.
    pub async fn subject_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Local interest count for one subject.
    pub async fn interest_count(&self, subject: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(subject)
            .map_or(0, |e| e.members.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wirehub_core::ids::{ConnectionId, UserId};

    fn conn(id: &str) -> Arc<ClientConnection> {
        ClientConnection::new(ConnectionId::new(id), None, 4).0
    }

    /// Counts concurrently-open subscriptions; the returned task decrements
    /// on teardown. `open` must never exceed one per subject.
    fn counting_subscribe(
        opened: Arc<AtomicUsize>,
        open: Arc<AtomicUsize>,
    ) -> impl FnOnce(SubjectMembers) -> std::future::Ready<Result<JoinHandle<()>, BackplaneError>>
    {
        move |_members| {
            opened.fetch_add(1, Ordering::SeqCst);
            let prev = open.fetch_add(1, Ordering::SeqCst);
            assert_eq!(prev, 0, "subject subscribed twice concurrently");
            let task = tokio::spawn(async move {
                let _guard = DecrementOnDrop(open);
                std::future::pending::<()>().await;
            });
            std::future::ready(Ok(task))
        }
    }

    struct DecrementOnDrop(Arc<AtomicUsize>);
    impl Drop for DecrementOnDrop {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn first_interest_opens_exactly_one_subscription() {
        let registry = SubscriptionRegistry::new("groups");
        let opened = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let a = conn("a");
        let b = conn("b");
        registry
            .add_interest("s", &a, counting_subscribe(opened.clone(), open.clone()))
            .await
            .unwrap();
        registry
            .add_interest("s", &b, counting_subscribe(opened.clone(), open.clone()))
            .await
            .unwrap();

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(registry.interest_count("s").await, 2);
    }

    #[tokio::test]
    async fn duplicate_interest_for_same_connection_is_ignored() {
        let registry = SubscriptionRegistry::new("groups");
        let opened = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let a = conn("a");
        for _ in 0..3 {
            registry
                .add_interest("s", &a, counting_subscribe(opened.clone(), open.clone()))
                .await
                .unwrap();
        }
        assert_eq!(registry.interest_count("s").await, 1);
    }

    #[tokio::test]
    async fn last_removal_closes_the_subscription() {
        let registry = SubscriptionRegistry::new("groups");
        let opened = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let a = conn("a");
        let b = conn("b");
        registry
            .add_interest("s", &a, counting_subscribe(opened.clone(), open.clone()))
            .await
            .unwrap();
        registry
            .add_interest("s", &b, counting_subscribe(opened.clone(), open.clone()))
            .await
            .unwrap();

        registry.remove_interest("s", &a).await;
        assert_eq!(open.load(Ordering::SeqCst), 1, "subscription closed too early");

        registry.remove_interest("s", &b).await;
        assert_eq!(open.load(Ordering::SeqCst), 0, "subscription not closed");
        assert_eq!(registry.subject_count().await, 0);
    }

    #[tokio::test]
    async fn removal_of_unknown_interest_is_a_noop() {
        let registry = SubscriptionRegistry::new("groups");
        registry.remove_interest("s", &conn("a")).await;
        assert_eq!(registry.subject_count().await, 0);
    }

    #[tokio::test]
    async fn aborted_connection_gains_no_subscription() {
        let registry = SubscriptionRegistry::new("connections");
        let opened = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let a = conn("a");
        a.abort_token().cancel();
        registry
            .add_interest("s", &a, counting_subscribe(opened.clone(), open.clone()))
            .await
            .unwrap();

        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert_eq!(registry.subject_count().await, 0);
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_no_phantom_entry() {
        let registry = SubscriptionRegistry::new("users");
        let a = conn("a");

        let result = registry
            .add_interest("s", &a, |_members| {
                std::future::ready(Err(BackplaneError::BusUnavailable))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(registry.subject_count().await, 0);

        // The subject is usable again afterwards.
        let opened = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        registry
            .add_interest("s", &a, counting_subscribe(opened.clone(), open.clone()))
            .await
            .unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_churn_never_double_opens() {
        let registry = Arc::new(SubscriptionRegistry::new("groups"));
        let opened = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let registry = Arc::clone(&registry);
            let opened = Arc::clone(&opened);
            let open = Arc::clone(&open);
            tasks.push(tokio::spawn(async move {
                let c = conn(&format!("c{worker}"));
                for _ in 0..25 {
                    registry
                        .add_interest("s", &c, counting_subscribe(opened.clone(), open.clone()))
                        .await
                        .unwrap();
                    registry.remove_interest("s", &c).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Every open was matched by a close and the interest map is empty.
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert_eq!(registry.subject_count().await, 0);
        assert!(opened.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn clear_tears_down_all_subjects() {
        let registry = SubscriptionRegistry::new("connections");
        let opened = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        for id in ["a", "b", "c"] {
            let c = conn(id);
            registry
                .add_interest(
                    &format!("s.{id}"),
                    &c,
                    counting_subscribe(opened.clone(), open.clone()),
                )
                .await
                .unwrap();
        }
        assert_eq!(open.load(Ordering::SeqCst), 3);

        registry.clear().await;
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert_eq!(registry.subject_count().await, 0);
    }

    #[tokio::test]
    async fn two_connections_of_one_user_count_separately() {
        let registry = SubscriptionRegistry::new("users");
        let opened = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let tab1 = ClientConnection::new(ConnectionId::new("a"), Some(UserId::new("u")), 4).0;
        let tab2 = ClientConnection::new(ConnectionId::new("b"), Some(UserId::new("u")), 4).0;
        registry
            .add_interest("h.user.u", &tab1, counting_subscribe(opened.clone(), open.clone()))
            .await
            .unwrap();
        registry
            .add_interest("h.user.u", &tab2, counting_subscribe(opened.clone(), open.clone()))
            .await
            .unwrap();

        assert_eq!(registry.interest_count("h.user.u").await, 2);

        registry.remove_interest("h.user.u", &tab1).await;
        assert_eq!(open.load(Ordering::SeqCst), 1);
        registry.remove_interest("h.user.u", &tab2).await;
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }
}
