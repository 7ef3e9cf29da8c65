use crate::common::from_millis;
use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use crate::store::{SqlDialect, SqliteDialect};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use rusqlite::{Connection, OptionalExtension};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Work to run after the enclosing transaction has rolled back.
pub type RollbackHook = Box<dyn FnOnce() + Send + 'static>;

/// Query execution capability shared by the store, the lock and the executor.
///
/// Wraps a single connection. A transaction opened on one thread holds the
/// connection until it ends; calls made on the same thread meanwhile join it.
/// Clones share the same connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    connection: ReentrantMutex<Connection>,
    /// `None` for in-memory databases and wrapped connections
    path: Option<PathBuf>,
    dialect: Arc<dyn SqlDialect>,
    depth: AtomicUsize,
    rollback_hooks: Mutex<Vec<RollbackHook>>,
}

impl Database {
    /// Opens (or creates) a SQLite database file.
    pub fn open<P: AsRef<Path>>(path: P) -> DarwinResult<Database> {
        let connection = Connection::open(path.as_ref()).map_err(|e| {
            log::error!("Failed to open database {:?}: {}", path.as_ref(), e);
            DarwinError::new_with_cause(
                &format!("Cannot open database {:?}", path.as_ref()),
                ErrorKind::ConnectivityError,
                e.into(),
            )
        })?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        Self::wrap(connection, Arc::new(SqliteDialect), Some(path.as_ref().to_path_buf()))
    }

    /// Opens a private in-memory SQLite database.
    pub fn open_in_memory() -> DarwinResult<Database> {
        let connection = Connection::open_in_memory()?;
        Self::with_connection(connection, Arc::new(SqliteDialect))
    }

    /// Wraps an already configured connection.
    pub fn with_connection(connection: Connection, dialect: Arc<dyn SqlDialect>) -> DarwinResult<Database> {
        Self::wrap(connection, dialect, None)
    }

    fn wrap(connection: Connection, dialect: Arc<dyn SqlDialect>, path: Option<PathBuf>) -> DarwinResult<Database> {
        connection.execute_batch(dialect.connection_setup())?;
        Ok(Database {
            inner: Arc::new(DatabaseInner {
                connection: ReentrantMutex::new(connection),
                path,
                dialect,
                depth: AtomicUsize::new(0),
                rollback_hooks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// A database on a connection of its own to the same file, so work on it
    /// never waits for this connection's mutex. Databases without a file
    /// share this connection instead.
    pub fn open_sibling(&self) -> DarwinResult<Database> {
        match &self.inner.path {
            Some(path) => {
                let connection = Connection::open(path)?;
                connection.busy_timeout(BUSY_TIMEOUT)?;
                Self::wrap(connection, self.inner.dialect.clone(), Some(path.clone()))
            }
            None => Ok(self.clone()),
        }
    }

    /// Whether both handles share one connection.
    pub fn shares_connection(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.inner.dialect.as_ref()
    }

    /// Checks the database answers and reports its platform.
    pub fn platform(&self) -> DarwinResult<String> {
        let guard = self.inner.connection.lock();
        match guard.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
            Ok(_) => Ok(self.inner.dialect.platform().to_string()),
            Err(e) => {
                log::error!("Database is not reachable: {}", e);
                Err(DarwinError::new_with_cause(
                    "Database is not reachable",
                    ErrorKind::ConnectivityError,
                    e.into(),
                ))
            }
        }
    }

    /// Runs `f` with exclusive use of the connection.
    pub fn run<T, F>(&self, f: F) -> DarwinResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.inner.connection.lock();
        f(&guard).map_err(DarwinError::from)
    }

    /// Like [`Database::run`], handing back the raw driver error so callers
    /// can tell constraint violations apart.
    pub fn run_raw<T, F>(&self, f: F) -> rusqlite::Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.inner.connection.lock();
        f(&guard)
    }

    /// Executes one statement of a migration script.
    ///
    /// Statements producing rows are stepped through and the number of rows
    /// is returned; others return the number of changed rows.
    pub fn execute(&self, sql: &str) -> DarwinResult<usize> {
        self.run(|conn| {
            let mut statement = conn.prepare(sql)?;
            if statement.column_count() > 0 {
                let mut rows = statement.query([])?;
                let mut count = 0;
                while rows.next()?.is_some() {
                    count += 1;
                }
                Ok(count)
            } else {
                statement.execute([])
            }
        })
    }

    /// Runs a query and reads the first column of its first row as a count.
    /// A query returning no rows counts as zero.
    pub fn query_count(&self, sql: &str) -> DarwinResult<i64> {
        self.run(|conn| {
            conn.query_row(sql, [], |row| row.get::<_, Option<i64>>(0))
                .optional()
                .map(|count| count.flatten().unwrap_or(0))
        })
    }

    pub fn table_exists(&self, table: &str) -> DarwinResult<bool> {
        let sql = self.dialect().table_exists();
        let count = self.run(|conn| conn.query_row(sql, [table], |row| row.get::<_, i64>(0)))?;
        Ok(count > 0)
    }

    /// Current time according to the database clock.
    pub fn current_time(&self) -> DarwinResult<DateTime<Utc>> {
        let sql = self.dialect().current_time_millis();
        let millis = self.run(|conn| conn.query_row(sql, [], |row| row.get::<_, i64>(0)))?;
        Ok(from_millis(millis))
    }

    /// `true` while a transaction is open on this database.
    pub fn is_in_transaction(&self) -> bool {
        self.inner.depth.load(Ordering::SeqCst) > 0
    }

    /// Runs `work` inside a transaction.
    ///
    /// The transaction commits when `work` succeeds and rolls back when it
    /// fails. Nested calls on the same thread join the outer transaction.
    /// Hooks registered through [`TransactionScope::on_rollback`] run once the
    /// outermost transaction has rolled back and the connection is free again.
    pub fn in_transaction<T, F>(&self, work: F) -> DarwinResult<T>
    where
        F: FnOnce(&TransactionScope<'_>) -> DarwinResult<T>,
    {
        let guard = self.inner.connection.lock();
        if self.inner.depth.load(Ordering::SeqCst) > 0 {
            let scope = TransactionScope::new(self, ScopeMode::Transactional);
            return work(&scope);
        }

        guard.execute_batch(self.dialect().begin_transaction())?;
        self.inner.depth.fetch_add(1, Ordering::SeqCst);
        let scope = TransactionScope::new(self, ScopeMode::Transactional);
        let result = work(&scope);
        self.inner.depth.fetch_sub(1, Ordering::SeqCst);

        let failure = match result {
            Ok(value) => match guard.execute_batch(self.dialect().commit_transaction()) {
                Ok(_) => {
                    self.inner.rollback_hooks.lock().clear();
                    return Ok(value);
                }
                Err(e) => {
                    log::error!("Failed to commit transaction: {}", e);
                    DarwinError::from(e)
                }
            },
            Err(e) => e,
        };

        if let Err(e) = guard.execute_batch(self.dialect().rollback_transaction()) {
            log::error!("Failed to roll back transaction: {}", e);
        }
        let hooks = std::mem::take(&mut *self.inner.rollback_hooks.lock());
        drop(guard);

        run_hooks(hooks);
        Err(failure)
    }

    /// Runs `work` in a transaction when `transactional` is set, otherwise in
    /// autocommit mode where every statement is committed as it runs and
    /// rollback hooks run right after `work` fails.
    pub fn in_scope<T, F>(&self, transactional: bool, work: F) -> DarwinResult<T>
    where
        F: FnOnce(&TransactionScope<'_>) -> DarwinResult<T>,
    {
        if transactional {
            return self.in_transaction(work);
        }

        let scope = TransactionScope::new(self, ScopeMode::Autocommit);
        match work(&scope) {
            Ok(value) => Ok(value),
            Err(e) => {
                let hooks = scope.local_hooks.take();
                run_hooks(hooks);
                Err(e)
            }
        }
    }
}

fn run_hooks(hooks: Vec<RollbackHook>) {
    if !hooks.is_empty() {
        log::debug!("Running {} after-rollback hook(s)", hooks.len());
    }
    for hook in hooks {
        hook();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeMode {
    Transactional,
    Autocommit,
}

/// Handle given to transactional work for registering after-rollback hooks.
pub struct TransactionScope<'a> {
    database: &'a Database,
    mode: ScopeMode,
    local_hooks: RefCell<Vec<RollbackHook>>,
}

impl<'a> TransactionScope<'a> {
    fn new(database: &'a Database, mode: ScopeMode) -> Self {
        TransactionScope {
            database,
            mode,
            local_hooks: RefCell::new(Vec::new()),
        }
    }

    pub fn database(&self) -> &Database {
        self.database
    }

    pub fn is_transactional(&self) -> bool {
        self.mode == ScopeMode::Transactional
    }

    /// Registers `hook` to run only if the work of this scope rolls back.
    pub fn on_rollback<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.mode {
            ScopeMode::Transactional => self.database.inner.rollback_hooks.lock().push(Box::new(hook)),
            ScopeMode::Autocommit => self.local_hooks.borrow_mut().push(Box::new(hook)),
        }
    }
}
