//! The backplane coordinator — ties the subject namespace, the subscription
//! registries, and the connection directory to one bus connection.
//!
//! Send variants are at-most-once, unordered fan-out: a send succeeds once
//! the local bus client accepts it, independent of whether any remote
//! process or connection ever receives it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use wirehub_bus::{Bus, BusSubscription};
use wirehub_core::ids::{ConnectionId, GroupName, ServerName, UserId};
use wirehub_core::subject::SubjectSpace;
use wirehub_core::wire::{GroupAction, GroupCommand, Invocation};

use crate::connection::{ClientConnection, OutboundCall};
use crate::directory::ConnectionDirectory;
use crate::error::BackplaneError;
use crate::registry::{SubjectMembers, SubscriptionRegistry};

/// Coordinator tunables. All overridable per deployment.
#[derive(Clone, Debug)]
pub struct BackplaneConfig {
    /// How long a caller blocks waiting for a reconnecting bus.
    pub reconnect_timeout: Duration,
    /// Poll interval while waiting out a reconnect.
    pub reconnect_poll: Duration,
    /// How long group membership changes wait for an ack.
    pub ack_timeout: Duration,
    /// Per-connection outbound queue capacity.
    pub delivery_queue: usize,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            reconnect_timeout: Duration::from_secs(60),
            reconnect_poll: Duration::from_millis(250),
            ack_timeout: Duration::from_secs(10),
            delivery_queue: 256,
        }
    }
}

struct Inner {
    subjects: SubjectSpace,
    server_name: ServerName,
    config: BackplaneConfig,
    bus: Arc<dyn Bus>,
    directory: ConnectionDirectory,
    connections: SubscriptionRegistry,
    groups: SubscriptionRegistry,
    users: SubscriptionRegistry,
    ack_counter: AtomicU32,
}

/// One process's view of the cluster-wide messaging domain.
///
/// Dropping the coordinator stops its background tasks; [`Backplane::shutdown`]
/// additionally tears down all subject subscriptions and flushes the bus.
pub struct Backplane {
    inner: Arc<Inner>,
    all_task: JoinHandle<()>,
    group_mgmt_task: JoinHandle<()>,
}

impl Backplane {
    /// Connect a coordinator for the hub type `hub` to `bus`. Opens the
    /// process-wide broadcast and group-management subscriptions.
    pub async fn start(
        hub: impl Into<String>,
        bus: Arc<dyn Bus>,
        config: BackplaneConfig,
    ) -> Result<Self, BackplaneError> {
        let inner = Arc::new(Inner {
            subjects: SubjectSpace::new(hub),
            server_name: ServerName::generate(),
            config,
            bus,
            directory: ConnectionDirectory::new(),
            connections: SubscriptionRegistry::new("connections"),
            groups: SubscriptionRegistry::new("groups"),
            users: SubscriptionRegistry::new("users"),
            ack_counter: AtomicU32::new(1),
        });
        inner.ensure_bus_ready().await?;

        let all_sub = inner.subscribe_checked(inner.subjects.all()).await?;
        let mgmt_sub = inner
            .subscribe_checked(inner.subjects.group_management())
            .await?;

        let all_task = tokio::spawn(run_all_delivery(Arc::clone(&inner), all_sub));
        let group_mgmt_task = tokio::spawn(run_group_management(Arc::clone(&inner), mgmt_sub));

        tracing::info!(
            hub = inner.subjects.hub(),
            server = %inner.server_name,
            "backplane started"
        );
        Ok(Self {
            inner,
            all_task,
            group_mgmt_task,
        })
    }

    pub fn server_name(&self) -> &ServerName {
        &self.inner.server_name
    }

    pub fn hub(&self) -> &str {
        self.inner.subjects.hub()
    }

    pub fn config(&self) -> &BackplaneConfig {
        &self.inner.config
    }

    /// Number of locally-attached connections.
    pub fn connection_count(&self) -> usize {
        self.inner.directory.len()
    }

    /// Locally-attached connections for one user.
    pub fn connections_for_user(&self, user: &UserId) -> usize {
        self.inner.directory.user_connections(user).len()
    }

    /// Attach a connection: index it and open interest for its connection
    /// subject and, when present, its user subject. Both subscriptions run
    /// concurrently; the call completes when both have.
    pub async fn on_connected(&self, conn: &Arc<ClientConnection>) -> Result<(), BackplaneError> {
        let inner = &self.inner;
        inner.ensure_bus_ready().await?;

        if !inner.directory.insert(Arc::clone(conn)) {
            tracing::warn!(connection_id = %conn.id(), "connection id already attached");
            return Ok(());
        }

        let conn_interest =
            inner.add_subject_interest(&inner.connections, inner.subjects.connection(conn.id()), conn);
        let user_interest = async {
            match conn.user_id() {
                Some(user) => {
                    inner
                        .add_subject_interest(&inner.users, inner.subjects.user(user), conn)
                        .await
                }
                None => Ok(()),
            }
        };
        tokio::try_join!(conn_interest, user_interest)?;
        Ok(())
    }

    /// Detach a connection: drop it from the directory and release every
    /// interest it held. Group removals are local only — the connection is
    /// gone, there is nothing to tell other processes. Teardown is purely
    /// local, so a dead bus cannot fail it.
    pub async fn on_disconnected(&self, conn: &Arc<ClientConnection>) {
        let inner = &self.inner;
        inner.directory.remove(conn.id());

        let groups = conn.groups();
        let conn_subject = inner.subjects.connection(conn.id());

        let drop_conn = inner.connections.remove_interest(&conn_subject, conn);
        let drop_groups = async {
            join_all(
                groups
                    .iter()
                    .map(|g| {
                        let subject = inner.subjects.group(g);
                        async move { inner.groups.remove_interest(&subject, conn).await }
                    }),
            )
            .await;
        };
        let drop_user = async {
            if let Some(user) = conn.user_id() {
                inner
                    .users
                    .remove_interest(&inner.subjects.user(user), conn)
                    .await;
            }
        };
        tokio::join!(drop_conn, drop_groups, drop_user);

        for g in &groups {
            conn.remove_group(g);
        }
    }

    /// Add a connection to a group, wherever in the cluster it lives.
    ///
    /// Applied directly when this process owns the connection, and always
    /// broadcast as a group command so the owning process applies it. The
    /// ack is best-effort: its absence (unknown connection, lost reply) is
    /// logged and swallowed.
    pub async fn add_to_group(
        &self,
        connection_id: &ConnectionId,
        group: &GroupName,
    ) -> Result<(), BackplaneError> {
        let inner = &self.inner;
        inner.ensure_bus_ready().await?;

        if let Some(conn) = inner.directory.get(connection_id) {
            inner.add_to_group_local(&conn, group).await?;
        }
        inner
            .replicate_group_command(GroupAction::Add, group, connection_id)
            .await;
        Ok(())
    }

    /// Remove a connection from a group; the mirror image of [`add_to_group`].
    ///
    /// [`add_to_group`]: Backplane::add_to_group
    pub async fn remove_from_group(
        &self,
        connection_id: &ConnectionId,
        group: &GroupName,
    ) -> Result<(), BackplaneError> {
        let inner = &self.inner;
        inner.ensure_bus_ready().await?;

        if let Some(conn) = inner.directory.get(connection_id) {
            inner.remove_from_group_local(&conn, group).await;
        }
        inner
            .replicate_group_command(GroupAction::Remove, group, connection_id)
            .await;
        Ok(())
    }

    pub async fn send_all(&self, method: &str, args: Vec<Vec<u8>>) -> Result<(), BackplaneError> {
        self.publish_invocation(vec![self.inner.subjects.all()], Invocation::new(method, args))
            .await
    }

    pub async fn send_all_except(
        &self,
        method: &str,
        args: Vec<Vec<u8>>,
        excluded: &[ConnectionId],
    ) -> Result<(), BackplaneError> {
        let invocation = Invocation::excluding(method, args, raw_ids(excluded));
        self.publish_invocation(vec![self.inner.subjects.all()], invocation)
            .await
    }

    pub async fn send_connection(
        &self,
        id: &ConnectionId,
        method: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<(), BackplaneError> {
        self.publish_invocation(
            vec![self.inner.subjects.connection(id)],
            Invocation::new(method, args),
        )
        .await
    }

    pub async fn send_connections(
        &self,
        ids: &[ConnectionId],
        method: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<(), BackplaneError> {
        let subjects = ids.iter().map(|id| self.inner.subjects.connection(id)).collect();
        self.publish_invocation(subjects, Invocation::new(method, args))
            .await
    }

    pub async fn send_group(
        &self,
        group: &GroupName,
        method: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<(), BackplaneError> {
        self.publish_invocation(
            vec![self.inner.subjects.group(group)],
            Invocation::new(method, args),
        )
        .await
    }

    pub async fn send_groups(
        &self,
        groups: &[GroupName],
        method: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<(), BackplaneError> {
        let subjects = groups.iter().map(|g| self.inner.subjects.group(g)).collect();
        self.publish_invocation(subjects, Invocation::new(method, args))
            .await
    }

    pub async fn send_group_except(
        &self,
        group: &GroupName,
        method: &str,
        args: Vec<Vec<u8>>,
        excluded: &[ConnectionId],
    ) -> Result<(), BackplaneError> {
        let invocation = Invocation::excluding(method, args, raw_ids(excluded));
        self.publish_invocation(vec![self.inner.subjects.group(group)], invocation)
            .await
    }

    pub async fn send_user(
        &self,
        user: &UserId,
        method: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<(), BackplaneError> {
        self.publish_invocation(
            vec![self.inner.subjects.user(user)],
            Invocation::new(method, args),
        )
        .await
    }

    pub async fn send_users(
        &self,
        users: &[UserId],
        method: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<(), BackplaneError> {
        let subjects = users.iter().map(|u| self.inner.subjects.user(u)).collect();
        self.publish_invocation(subjects, Invocation::new(method, args))
            .await
    }

    /// Stop the process-wide tasks, tear down all subject subscriptions, and
    /// flush the bus.
    pub async fn shutdown(mut self) {
        self.all_task.abort();
        self.group_mgmt_task.abort();
        let _ = (&mut self.all_task).await;
        let _ = (&mut self.group_mgmt_task).await;

        self.inner.connections.clear().await;
        self.inner.groups.clear().await;
        self.inner.users.clear().await;

        if let Err(err) = self.inner.bus.flush().await {
            tracing::warn!(error = %err, "bus flush failed during shutdown");
        }
        tracing::info!(server = %self.inner.server_name, "backplane stopped");
    }

    /// Serialize one invocation and publish it to every subject, fanning the
    /// publishes out concurrently. Completion means the local bus client
    /// accepted each publish.
    async fn publish_invocation(
        &self,
        subjects: Vec<String>,
        invocation: Invocation,
    ) -> Result<(), BackplaneError> {
        let inner = &self.inner;
        inner.ensure_bus_ready().await?;

        let payload = invocation.encode()?;
        try_join_all(subjects.into_iter().map(|subject| {
            let payload = payload.clone();
            async move {
                inner
                    .bus
                    .publish(&subject, payload)
                    .await
                    .map_err(|source| BackplaneError::Publish { subject, source })
            }
        }))
        .await?;
        Ok(())
    }
}

impl Drop for Backplane {
    fn drop(&mut self) {
        self.all_task.abort();
        self.group_mgmt_task.abort();
    }
}

impl Inner {
    /// Fail fast on a permanently closed bus; wait out a reconnect with
    /// bounded polling. Invoked lazily by every bus-dependent operation so
    /// transient outages self-heal without restarting the coordinator.
    async fn ensure_bus_ready(&self) -> Result<(), BackplaneError> {
        if self.bus.is_closed() {
            return Err(BackplaneError::BusUnavailable);
        }
        if !self.bus.is_reconnecting() {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.reconnect_timeout;
        loop {
            tokio::time::sleep(self.config.reconnect_poll).await;
            if self.bus.is_closed() {
                return Err(BackplaneError::BusUnavailable);
            }
            if !self.bus.is_reconnecting() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BackplaneError::ReconnectTimeout(self.config.reconnect_timeout));
            }
        }
    }

    async fn subscribe_checked(&self, subject: String) -> Result<BusSubscription, BackplaneError> {
        self.bus
            .subscribe(&subject)
            .await
            .map_err(|source| BackplaneError::Subscribe { subject, source })
    }

    async fn add_subject_interest(
        &self,
        registry: &SubscriptionRegistry,
        subject: String,
        conn: &Arc<ClientConnection>,
    ) -> Result<(), BackplaneError> {
        let open_subject = subject.clone();
        registry
            .add_interest(&subject, conn, move |members| {
                self.open_delivery(open_subject, members)
            })
            .await
    }

    /// Open the single bus subscription for a subject and hand it to a
    /// dedicated delivery task.
    async fn open_delivery(
        &self,
        subject: String,
        members: SubjectMembers,
    ) -> Result<JoinHandle<()>, BackplaneError> {
        let sub = self.subscribe_checked(subject).await?;
        Ok(tokio::spawn(run_subject_delivery(sub, members)))
    }

    /// Local half of a group add. Idempotent: re-adding a member is a no-op.
    async fn add_to_group_local(
        &self,
        conn: &Arc<ClientConnection>,
        group: &GroupName,
    ) -> Result<(), BackplaneError> {
        if !conn.add_group(group) {
            return Ok(());
        }
        let subject = self.subjects.group(group);
        match self.add_subject_interest(&self.groups, subject, conn).await {
            Ok(()) => Ok(()),
            Err(err) => {
                conn.remove_group(group);
                Err(err)
            }
        }
    }

    async fn remove_from_group_local(&self, conn: &Arc<ClientConnection>, group: &GroupName) {
        if conn.remove_group(group) {
            self.groups
                .remove_interest(&self.subjects.group(group), conn)
                .await;
        }
    }

    /// Broadcast a group command and wait for one ack. Ack failures are
    /// logged and swallowed: the caller cannot distinguish "connection
    /// unknown anywhere" from "ack lost".
    async fn replicate_group_command(
        &self,
        action: GroupAction,
        group: &GroupName,
        connection_id: &ConnectionId,
    ) {
        let cmd = GroupCommand {
            id: self.ack_counter.fetch_add(1, Ordering::Relaxed),
            server_name: self.server_name.as_str().to_owned(),
            action,
            group: group.as_str().to_owned(),
            connection_id: connection_id.as_str().to_owned(),
        };
        let payload = match cmd.encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode group command");
                return;
            }
        };

        match self
            .bus
            .request(&self.subjects.group_management(), payload, self.config.ack_timeout)
            .await
        {
            Ok(reply) => {
                if reply != cmd.ack_payload() {
                    tracing::debug!(
                        command_id = cmd.id,
                        "group command ack did not echo the command id"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    group = %group,
                    connection_id = %connection_id,
                    error = %err,
                    "group command not acknowledged"
                );
            }
        }
    }
}

/// Delivery task for one registry-managed subject.
async fn run_subject_delivery(mut sub: BusSubscription, members: SubjectMembers) {
    while let Some(msg) = sub.recv().await {
        let invocation = match Invocation::decode(&msg.payload) {
            Ok(invocation) => invocation,
            Err(err) => {
                tracing::warn!(subject = %msg.subject, error = %err, "dropping malformed invocation");
                continue;
            }
        };
        let targets: Vec<Arc<ClientConnection>> = members
            .read()
            .iter()
            .filter(|c| !c.is_aborted() && !invocation.is_excluded(c.id().as_str()))
            .map(Arc::clone)
            .collect();
        fan_out(&invocation, &targets);
    }
}

/// Delivery task for the broadcast subject: every local connection is an
/// implicit subscriber.
async fn run_all_delivery(inner: Arc<Inner>, mut sub: BusSubscription) {
    while let Some(msg) = sub.recv().await {
        let invocation = match Invocation::decode(&msg.payload) {
            Ok(invocation) => invocation,
            Err(err) => {
                tracing::warn!(subject = %msg.subject, error = %err, "dropping malformed invocation");
                continue;
            }
        };
        let targets: Vec<Arc<ClientConnection>> = inner
            .directory
            .all()
            .into_iter()
            .filter(|c| !c.is_aborted() && !invocation.is_excluded(c.id().as_str()))
            .collect();
        fan_out(&invocation, &targets);
    }
}

/// Apply group commands for connections this process owns and ack them.
/// Commands for connections owned elsewhere are ignored without reply.
async fn run_group_management(inner: Arc<Inner>, mut sub: BusSubscription) {
    while let Some(msg) = sub.recv().await {
        let cmd = match GroupCommand::decode(&msg.payload) {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::warn!(subject = %msg.subject, error = %err, "dropping malformed group command");
                continue;
            }
        };

        let connection_id = ConnectionId::new(cmd.connection_id.clone());
        let Some(conn) = inner.directory.get(&connection_id) else {
            continue;
        };

        let group = GroupName::new(cmd.group.clone());
        let applied = match cmd.action {
            GroupAction::Add => inner.add_to_group_local(&conn, &group).await,
            GroupAction::Remove => {
                inner.remove_from_group_local(&conn, &group).await;
                Ok(())
            }
        };

        match applied {
            Ok(()) => {
                if let Some(reply_to) = &msg.reply_to {
                    if let Err(err) = inner.bus.publish(reply_to, cmd.ack_payload()).await {
                        tracing::warn!(command_id = cmd.id, error = %err, "failed to ack group command");
                    }
                }
            }
            Err(err) => {
                tracing::error!(
                    group = %group,
                    connection_id = %connection_id,
                    origin = %cmd.server_name,
                    error = %err,
                    "applying group command failed"
                );
            }
        }
    }
}

/// Per-connection delivery; a failure affects only that connection.
fn fan_out(invocation: &Invocation, targets: &[Arc<ClientConnection>]) {
    for conn in targets {
        let call = OutboundCall {
            method: invocation.method.clone(),
            args: invocation.args.clone(),
        };
        if let Err(err) = conn.deliver(call) {
            tracing::warn!(
                connection_id = %conn.id(),
                method = %invocation.method,
                error = %err,
                "delivery failed"
            );
        }
    }
}

fn raw_ids(ids: &[ConnectionId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_owned()).collect()
}
