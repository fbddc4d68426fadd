//! One connection and one transaction per unit of work.

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, Params, Row};

use crate::error::DriverError;
use crate::unit_of_work::{UnitOfWork, UnitOfWorkFactory, UnitOfWorkId};

/// How the transaction of a unit of work is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BeginMode {
    /// Locks are taken on first read or write.
    #[default]
    Deferred,
    /// The write lock is taken at `BEGIN`; conflicts surface at creation.
    Immediate,
    /// Exclusive lock at `BEGIN`.
    Exclusive,
}

impl BeginMode {
    fn statement(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Connection settings for [`SqliteUnitOfWorkFactory`].
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteOptions {
    /// How long SQLite waits on a lock before reporting `SQLITE_BUSY`.
    ///
    /// The wait happens inside a synchronous call, on the worker thread
    /// polling the executor.
    pub busy_timeout: Duration,
    /// How transactions begin.
    pub begin_mode: BeginMode,
    /// Run `PRAGMA foreign_keys = ON` on every connection.
    pub foreign_keys: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::ZERO,
            begin_mode: BeginMode::Deferred,
            foreign_keys: true,
        }
    }
}

/// Opens a fresh connection to a SQLite database file per unit of work.
///
/// # Example
///
/// ```rust
/// use txretry::sqlite::{BeginMode, SqliteUnitOfWorkFactory};
/// use txretry::{RetryExecutor, RetryPolicy};
///
/// # tokio_test::block_on(async {
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join("shop.sqlite3");
/// rusqlite::Connection::open(&path)
///     .unwrap()
///     .execute_batch("CREATE TABLE products (name TEXT NOT NULL);")
///     .unwrap();
///
/// let factory = SqliteUnitOfWorkFactory::new(&path).with_begin_mode(BeginMode::Immediate);
/// let executor = RetryExecutor::new(factory, RetryPolicy::default());
///
/// let rows = executor
///     .execute(|uow| Box::pin(async move {
///         uow.execute("INSERT INTO products (name) VALUES (?1)", ["lamp"])?;
///         Ok(uow.query_row("SELECT COUNT(*) FROM products", [], |row| row.get::<_, i64>(0))?)
///     }))
///     .await
///     .unwrap();
///
/// assert_eq!(rows, 1);
/// # });
/// ```
pub struct SqliteUnitOfWorkFactory<S = ()> {
    path: PathBuf,
    options: SqliteOptions,
    _scope: PhantomData<fn() -> S>,
}

impl<S> Clone for SqliteUnitOfWorkFactory<S> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            options: self.options.clone(),
            _scope: PhantomData,
        }
    }
}

impl<S> fmt::Debug for SqliteUnitOfWorkFactory<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteUnitOfWorkFactory")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish()
    }
}

impl SqliteUnitOfWorkFactory {
    /// Factory for the database file at `path`, with default options and no
    /// scope.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::scoped(path)
    }
}

impl<S> SqliteUnitOfWorkFactory<S> {
    /// Factory whose units of work carry a scope of type `S`.
    ///
    /// ```rust
    /// use txretry::sqlite::SqliteUnitOfWorkFactory;
    ///
    /// let factory = SqliteUnitOfWorkFactory::<String>::scoped("tenants.sqlite3");
    /// assert_eq!(factory.path().to_str(), Some("tenants.sqlite3"));
    /// ```
    pub fn scoped(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options: SqliteOptions::default(),
            _scope: PhantomData,
        }
    }

    /// Replace every option at once.
    pub fn with_options(mut self, options: SqliteOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the transaction begin mode.
    pub fn with_begin_mode(mut self, mode: BeginMode) -> Self {
        self.options.begin_mode = mode;
        self
    }

    /// Set the busy timeout.
    ///
    /// Statements run inline on the tokio worker thread, so a nonzero
    /// timeout lets one contended statement block that thread, and every
    /// task scheduled on it, for up to `timeout`. The default of zero hands
    /// the conflict straight back to the executor, which backs off on a
    /// timer instead.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.options.busy_timeout = timeout;
        self
    }

    /// The database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The connection settings.
    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }

    fn open(&self) -> Result<Connection, DriverError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.options.busy_timeout)?;
        if self.options.foreign_keys {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        }
        conn.execute_batch(self.options.begin_mode.statement())?;
        Ok(conn)
    }
}

impl<S> UnitOfWorkFactory for SqliteUnitOfWorkFactory<S>
where
    S: Clone + Default + Send + Sync + 'static,
{
    type Unit = SqliteUnitOfWork<S>;
    type Scope = S;

    async fn create_scoped(&self, scope: S) -> Result<SqliteUnitOfWork<S>, DriverError> {
        let conn = self.open()?;
        let id = UnitOfWorkId::new();
        tracing::trace!(unit_of_work = %id, path = %self.path.display(), "transaction started");
        Ok(SqliteUnitOfWork {
            id,
            conn,
            scope,
            released: false,
        })
    }
}

/// A connection with an open transaction.
///
/// Dropping it without [`dispose`](UnitOfWork::dispose) rolls back.
pub struct SqliteUnitOfWork<S = ()> {
    id: UnitOfWorkId,
    conn: Connection,
    scope: S,
    released: bool,
}

impl<S> fmt::Debug for SqliteUnitOfWork<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteUnitOfWork")
            .field("id", &self.id)
            .field("in_transaction", &!self.conn.is_autocommit())
            .field("released", &self.released)
            .finish()
    }
}

impl<S> SqliteUnitOfWork<S> {
    /// The underlying connection, inside the open transaction.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The scope this unit of work was created with.
    pub fn scope(&self) -> &S {
        &self.scope
    }

    /// Run a statement, returning the number of changed rows.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize, DriverError> {
        Ok(self.conn.execute(sql, params)?)
    }

    /// Run a query expected to return exactly one row.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T, DriverError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.conn.query_row(sql, params, f)?)
    }

    fn rollback(&self) -> Result<(), DriverError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

impl<S> UnitOfWork for SqliteUnitOfWork<S>
where
    S: Send + 'static,
{
    fn id(&self) -> UnitOfWorkId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.released && !self.conn.is_autocommit()
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    async fn dispose(mut self) -> Result<(), DriverError> {
        self.released = true;
        self.rollback()
    }
}

impl<S> Drop for SqliteUnitOfWork<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.rollback() {
            tracing::warn!(unit_of_work = %self.id, "rollback on drop failed: {}", err);
        }
    }
}
