//! The backend connection handle shared by the executor and the adapter.

mod capabilities;
mod events;
mod notifications;
mod type_mapper;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio_postgres::config::Host;
use tokio_postgres::{AsyncMessage, Client, Config, Connection, NoTls};

use crate::error::SqlMiddlewareDbError;
use crate::postgres::query::simple_row;

pub use capabilities::{Capabilities, ConnectionSnapshot, ServerVersion};
pub(crate) use capabilities::setting_enabled;
pub(crate) use events::EventRegistry;
pub use events::{EventKind, NoticeHandler, NotificationHandler, SubscriptionHandle};
pub(crate) use notifications::NotificationQueue;
pub use notifications::timeout_from_millis;
pub use type_mapper::TypeMapper;

/// A rollback spawned for a dropped transaction; later commands wait on it.
type PendingRollback = Shared<BoxFuture<'static, ()>>;

/// How long `close` waits for the session to terminate before aborting the socket.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A live PostgreSQL session.
///
/// Wraps a `tokio_postgres::Client` together with the task that drives its
/// `Connection`. The driver task forwards notices and notifications to subscribers
/// and records pending notifications for waiters.
pub struct PgConnection {
    client: RwLock<Option<Client>>,
    config: Config,
    runtime: Handle,
    capabilities: Capabilities,
    close_grace: Duration,
    closed: Arc<AtomicBool>,
    in_transaction: AtomicBool,
    pending_rollback: Mutex<Option<PendingRollback>>,
    copy_active: Arc<AtomicBool>,
    events: Arc<EventRegistry>,
    notifications: Arc<NotificationQueue>,
    type_mapper: Arc<TypeMapper>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("hosts", &self.config.get_hosts())
            .field("dbname", &self.config.get_dbname())
            .field("capabilities", &self.capabilities)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl PgConnection {
    /// Open a session without TLS.
    ///
    /// # Errors
    /// Returns the backend error if connecting or the startup queries fail.
    pub async fn connect(config: Config) -> Result<Self, SqlMiddlewareDbError> {
        tracing::debug!(
            hosts = ?config.get_hosts(),
            db = ?config.get_dbname(),
            user = ?config.get_user(),
            "postgres connect start"
        );
        let (client, connection) = config.connect(NoTls).await?;
        Self::from_parts(config, client, connection).await
    }

    /// Adopt an already established `tokio-postgres` client/connection pair, e.g. one
    /// opened with a TLS connector. The connection must not be polled elsewhere.
    ///
    /// # Errors
    /// Returns `SqlMiddlewareDbError::ConfigError` outside a tokio runtime, or the backend
    /// error if the startup queries fail.
    pub async fn from_parts<S, T>(
        config: Config,
        client: Client,
        connection: Connection<S, T>,
    ) -> Result<Self, SqlMiddlewareDbError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| {
            SqlMiddlewareDbError::ConfigError(format!("a tokio runtime is required: {e}"))
        })?;

        let closed = Arc::new(AtomicBool::new(false));
        let events = Arc::new(EventRegistry::default());
        let notifications = Arc::new(NotificationQueue::default());
        let driver = runtime.spawn(drive(
            connection,
            Arc::clone(&events),
            Arc::clone(&notifications),
            Arc::clone(&closed),
        ));

        let version_num = simple_row(&client, "SHOW server_version_num").await?;
        let server_version_num = version_num
            .first()
            .and_then(Option::as_deref)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                SqlMiddlewareDbError::ExecutionError(format!(
                    "unexpected server_version_num: {version_num:?}"
                ))
            })?;
        let capabilities = Capabilities {
            server_version_num,
            blocking_calls: runtime.runtime_flavor() == RuntimeFlavor::MultiThread,
        };

        let type_mapper = Arc::new(TypeMapper::default());
        type_mapper.load(&client).await?;

        tracing::debug!(?capabilities, "postgres connect established");
        Ok(PgConnection {
            client: RwLock::new(Some(client)),
            config,
            runtime,
            capabilities,
            close_grace: DEFAULT_CLOSE_GRACE,
            closed,
            in_transaction: AtomicBool::new(false),
            pending_rollback: Mutex::new(None),
            copy_active: Arc::new(AtomicBool::new(false)),
            events,
            notifications,
            type_mapper,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Set how long `close` waits for a graceful shutdown.
    #[must_use]
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// False once the session was closed or the server dropped it.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// True while a transaction started through this crate is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    /// True while a COPY transfer channel is open.
    #[must_use]
    pub fn copy_in_progress(&self) -> bool {
        self.copy_active.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), SqlMiddlewareDbError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SqlMiddlewareDbError::closed())
        }
    }

    /// Borrow the client for one operation. Holding the guard keeps `close` waiting.
    pub(crate) async fn client(&self) -> Result<RwLockReadGuard<'_, Client>, SqlMiddlewareDbError> {
        let guard = self.client.read().await;
        self.ensure_open()?;
        RwLockReadGuard::try_map(guard, Option::as_ref).map_err(|_| SqlMiddlewareDbError::closed())
    }

    /// Like `client`, but refuses while a COPY channel owns the wire and runs after any
    /// rollback still pending for a dropped transaction.
    pub(crate) async fn command_client(
        &self,
    ) -> Result<RwLockReadGuard<'_, Client>, SqlMiddlewareDbError> {
        self.settle_rollback().await;
        if self.copy_in_progress() {
            return Err(SqlMiddlewareDbError::ProtocolError(
                "connection is busy with an open COPY channel; finish or cancel it first"
                    .to_string(),
            ));
        }
        self.client().await
    }

    pub(crate) fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub(crate) fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    /// Notifications received since the last completed wait.
    #[must_use]
    pub fn pending_notifications(&self) -> usize {
        self.notifications.pending()
    }

    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.events.subscriber_count(kind)
    }

    #[must_use]
    pub fn type_mapper(&self) -> &Arc<TypeMapper> {
        &self.type_mapper
    }

    pub(crate) fn copy_flag(&self) -> &Arc<AtomicBool> {
        &self.copy_active
    }

    pub(crate) fn closed_flag(&self) -> &Arc<AtomicBool> {
        &self.closed
    }

    /// Claim the transaction slot; false if a transaction is already open.
    pub(crate) fn try_start_transaction(&self) -> bool {
        self.in_transaction
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_transaction(&self) {
        self.in_transaction.store(false, Ordering::Release);
    }

    /// Spawn `rollback` and make every later command, begin and COPY wait for it.
    /// `rollback` is expected to end the transaction slot itself.
    pub(crate) fn defer_rollback<F>(&self, rollback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = self.runtime.spawn(rollback);
        let pending = async move {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "background rollback task failed");
            }
        }
        .boxed()
        .shared();
        *self
            .pending_rollback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pending);
    }

    /// Wait for a rollback queued by `defer_rollback`, if one is still running.
    pub(crate) async fn settle_rollback(&self) {
        let pending = self
            .pending_rollback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(pending) = pending else {
            return;
        };
        pending.await;
        let mut slot = self
            .pending_rollback
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|p| p.peek().is_some()) {
            *slot = None;
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// First configured host; unix socket directories are rendered as paths.
    #[must_use]
    pub fn host(&self) -> String {
        match self.config.get_hosts().first() {
            Some(Host::Tcp(name)) => name.clone(),
            #[cfg(unix)]
            Some(Host::Unix(path)) => path.display().to_string(),
            None => "localhost".to_string(),
        }
    }

    /// First configured port, 5432 when none is set.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.config.get_ports().first().copied().unwrap_or(5432)
    }

    /// Run `future` to completion on the calling thread.
    ///
    /// Outside a runtime this uses the connection's runtime handle; inside a multi-thread
    /// runtime the worker is handed off with `block_in_place`.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> Result<F::Output, SqlMiddlewareDbError> {
        if !self.capabilities.blocking_calls {
            return Err(SqlMiddlewareDbError::Unimplemented(
                "blocking calls need the connection to run on a multi-thread tokio runtime"
                    .to_string(),
            ));
        }
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                Ok(tokio::task::block_in_place(|| current.block_on(future)))
            }
            Ok(_) => Err(SqlMiddlewareDbError::Unimplemented(
                "blocking calls are not available on a current-thread runtime".to_string(),
            )),
            Err(_) => Ok(self.runtime().block_on(future)),
        }
    }

    /// Terminate the session and release its resources.
    ///
    /// Waits for in-flight operations, drops the client so the driver sends Terminate,
    /// and waits up to the close grace period for the driver to finish. An open COPY
    /// channel makes the close abort the socket immediately; the channel fails afterwards.
    ///
    /// # Errors
    /// Returns `SqlMiddlewareDbError::ConnectionStateError` if the connection was already closed.
    pub async fn close(&self) -> Result<(), SqlMiddlewareDbError> {
        let client = self.client.write().await.take().ok_or_else(|| {
            SqlMiddlewareDbError::ConnectionStateError("connection is already closed".to_string())
        })?;
        self.closed.store(true, Ordering::Release);
        self.end_transaction();
        let force = self.copy_in_progress();
        drop(client);

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut driver) = driver {
            if force {
                tracing::warn!("closing with an open COPY channel; aborting the connection");
                driver.abort();
            } else if tokio::time::timeout(self.close_grace, &mut driver)
                .await
                .is_err()
            {
                tracing::warn!(grace = ?self.close_grace, "session did not terminate in time; aborting");
                driver.abort();
            }
        }

        self.notifications.close();
        self.events.clear();
        tracing::info!(host = %self.host(), port = self.port(), "postgres connection closed");
        Ok(())
    }
}

async fn drive<S, T>(
    mut connection: Connection<S, T>,
    events: Arc<EventRegistry>,
    notifications: Arc<NotificationQueue>,
    closed: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut messages = futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));
    while let Some(message) = messages.next().await {
        match message {
            Ok(AsyncMessage::Notice(notice)) => {
                tracing::debug!(
                    severity = notice.severity(),
                    code = notice.code().code(),
                    "notice: {}",
                    notice.message()
                );
                events.dispatch_notice(&notice);
            }
            Ok(AsyncMessage::Notification(notification)) => {
                tracing::debug!(
                    channel = notification.channel(),
                    process_id = notification.process_id(),
                    "notification received"
                );
                events.dispatch_notification(&notification);
                notifications.push();
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "postgres connection terminated with an error");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    notifications.close();
    tracing::debug!("postgres connection driver finished");
}
