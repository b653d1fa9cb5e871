//! Shared fakes for integration tests.
//!
//! `FakeDb` stands in for PostgreSQL: pool-level statements fail with a scripted
//! sequence of SQLSTATE codes, and transactions buffer writes until `COMMIT` so
//! tests can observe what actually became durable. Like `sqlx::Transaction`, a
//! transaction handle dropped while open rolls back.

#![allow(dead_code)]

use async_trait::async_trait;
use resilient_pg::config::{EnvSource, PoolOptions};
use resilient_pg::db::{
    ConnectionPool, PoolFactory, SecretsProvider, Sleeper, TransactionConnection,
};
use resilient_pg::models::{Credentials, QueryParam, QueryResult};
use resilient_pg::{DbError, DbResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

pub fn env(pairs: &[(&str, &str)]) -> Arc<dyn EnvSource> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Arc::new(map)
}

/// Error as the driver would report a server-side failure.
pub fn sql_error(code: &str) -> DbError {
    DbError::database(format!("server reported {code}"), Some(code.to_string()), "")
}

// =============================================================================
// Database
// =============================================================================

#[derive(Default)]
pub struct FakeDb {
    /// SQLSTATE codes returned by successive pool-level executions.
    failures: Mutex<VecDeque<&'static str>>,
    /// Statement inside a transaction that fails, with its code.
    fail_statement: Mutex<Option<(String, &'static str)>>,
    committed: Mutex<Vec<String>>,
    pub attempts: AtomicUsize,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub rolled_back: AtomicUsize,
    pub closed: AtomicUsize,
}

impl FakeDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next executions with `codes`, in order, then succeed.
    pub fn fail_with(&self, codes: &[&'static str]) {
        self.failures.lock().unwrap().extend(codes.iter().copied());
    }

    /// Fail the transaction statement `sql` with `code`.
    pub fn fail_statement(&self, sql: &str, code: &'static str) {
        *self.fail_statement.lock().unwrap() = Some((sql.to_string(), code));
    }

    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

pub struct FakePool {
    db: Arc<FakeDb>,
}

impl FakePool {
    pub fn new(db: Arc<FakeDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConnectionPool for FakePool {
    async fn execute(&self, sql: &str, _params: &[QueryParam]) -> DbResult<QueryResult> {
        self.db.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.db.failures.lock().unwrap().pop_front() {
            return Err(sql_error(code));
        }
        self.db.committed.lock().unwrap().push(sql.to_string());
        Ok(QueryResult::affected(1))
    }

    async fn begin(&self) -> DbResult<Box<dyn TransactionConnection>> {
        self.db.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransaction {
            db: self.db.clone(),
            pending: Vec::new(),
            open: true,
        }))
    }

    async fn close(&self) {
        self.db.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeTransaction {
    db: Arc<FakeDb>,
    pending: Vec<String>,
    open: bool,
}

impl Drop for FakeTransaction {
    fn drop(&mut self) {
        if self.open {
            self.db.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
        self.db.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionConnection for FakeTransaction {
    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<QueryResult> {
        let failing = self.db.fail_statement.lock().unwrap().clone();
        if let Some((_, code)) = failing.filter(|(stmt, _)| stmt == sql) {
            return Err(sql_error(code));
        }
        self.pending.push(sql.to_string());
        Ok(QueryResult::affected(1))
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let mut this = self;
        let pending = std::mem::take(&mut this.pending);
        this.db.committed.lock().unwrap().extend(pending);
        this.open = false;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        let mut this = self;
        this.pending.clear();
        this.open = false;
        this.db.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    db: Arc<FakeDb>,
    pub created: AtomicUsize,
}

impl FakeFactory {
    pub fn new(db: Arc<FakeDb>) -> Arc<Self> {
        Arc::new(Self {
            db,
            created: AtomicUsize::new(0),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolFactory for FakeFactory {
    async fn create(
        &self,
        _credentials: &Credentials,
        _options: &PoolOptions,
    ) -> DbResult<Arc<dyn ConnectionPool>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakePool::new(self.db.clone())))
    }
}

// =============================================================================
// Secrets store and sleeper
// =============================================================================

pub struct CountingSecrets {
    payload: String,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl CountingSecrets {
    pub fn new(payload: &str) -> Arc<Self> {
        Arc::new(Self {
            payload: payload.to_string(),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(payload: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            payload: payload.to_string(),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretsProvider for CountingSecrets {
    async fn get_secret(&self, _secret_id: &str) -> DbResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.payload.clone())
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays_ms(&self) -> Vec<u128> {
        self.delays.lock().unwrap().iter().map(|d| d.as_millis()).collect()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

// =============================================================================
// Log capture
// =============================================================================

/// Collects the `message` of every event emitted while installed.
#[derive(Clone, Default)]
pub struct LogCapture {
    messages: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    /// Install as the thread's default subscriber until the guard drops.
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn count(&self, message: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == message)
            .count()
    }
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.messages.lock().unwrap().push(message);
        }
    }
}
