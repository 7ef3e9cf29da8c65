use darwin::darwin::Darwin;
use darwin::darwin_builder::DarwinBuilder;
use darwin::errors::{DarwinError, DarwinResult, ErrorKind};
use darwin::resource::MemoryResourceProvider;
use darwin::store::{Database, SqliteDialect};
use std::backtrace::Backtrace;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Component every test context registers its scripts under.
pub const COMPONENT: &str = "shop";

/// Runs a test with retry logic and error handling.
/// Tests run on the current thread; lease timing makes a few of them flaky on
/// loaded machines, hence the retries.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> DarwinResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> DarwinResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> DarwinResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    const MAX_RETRIES: u32 = 3;
    let mut last_error: Option<String> = None;
    let mut last_backtrace: Option<String> = None;

    for attempt in 1..=MAX_RETRIES {
        let start_time = Instant::now();

        let result = std::panic::catch_unwind(|| {
            let backtrace = Backtrace::capture();
            match before() {
                Ok(ctx) => match test(ctx.clone()) {
                    Ok(_) => after(ctx)
                        .map_err(|e| (format!("After run failed: {:?}", e), backtrace.to_string())),
                    Err(e) => {
                        let _ = after(ctx);
                        Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                    }
                },
                Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
            }
        });

        let elapsed = start_time.elapsed();

        let failure = match result {
            Ok(Ok(_)) => return, // Test passed
            Ok(Err((e, bt))) => {
                last_backtrace = Some(bt);
                e
            }
            Err(panic_err) => {
                let err_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    format!("Unknown panic: {:?}", panic_err.type_id())
                };
                last_backtrace = Some(Backtrace::capture().to_string());
                format!("Panic: {}", err_msg)
            }
        };

        if attempt < MAX_RETRIES {
            eprintln!(
                "\n========== Test Attempt {}/{} Failed (took {:?}) ==========",
                attempt, MAX_RETRIES, elapsed
            );
            eprintln!("Error: {}", failure);
            eprintln!("Retrying in {}ms...\n", 100 * attempt);
            thread::sleep(Duration::from_millis(100 * attempt as u64));
        }
        last_error = Some(failure);
    }

    // All retries exhausted - print full details
    eprintln!("\n==================== TEST FAILED ====================");
    eprintln!("Failed after {} attempts", MAX_RETRIES);
    eprintln!("Last error: {}", last_error.as_deref().unwrap_or("Unknown"));
    if let Some(bt) = &last_backtrace {
        if !bt.is_empty() && !bt.contains("disabled") {
            eprintln!("\nBacktrace:\n{}", bt);
        }
    }
    eprintln!("=====================================================\n");

    panic!(
        "Test failed after {} attempts. Last error: {}",
        MAX_RETRIES,
        last_error.unwrap_or_default()
    );
}

/// A SQLite database file in its own temporary directory, plus the scripts
/// of [`COMPONENT`].
///
/// Every [`TestContext::member`] opens a new connection to the same file, the
/// way separate cluster members would.
#[derive(Clone)]
pub struct TestContext {
    dir: Arc<TempDir>,
    path: PathBuf,
    scripts: MemoryResourceProvider,
}

impl TestContext {
    pub fn new(dir: TempDir) -> Self {
        let path = dir.path().join("darwin.db");
        Self {
            dir: Arc::new(dir),
            path,
            scripts: MemoryResourceProvider::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Scripts of [`COMPONENT`], shared with every member opened from this
    /// context.
    pub fn scripts(&self) -> MemoryResourceProvider {
        self.scripts.clone()
    }

    /// Adds a `sqlite/<name>` script.
    pub fn script(&self, name: &str, text: &str) -> &Self {
        self.scripts.put(&format!("sqlite/{}", name), text);
        self
    }

    /// A fresh connection to the database file.
    pub fn connection(&self) -> DarwinResult<Database> {
        Database::open(&self.path)
    }

    /// A connection that gives up after `busy_timeout` while another
    /// connection holds the write lock.
    pub fn impatient_connection(&self, busy_timeout: Duration) -> DarwinResult<Database> {
        let connection = rusqlite::Connection::open(&self.path)?;
        connection.busy_timeout(busy_timeout)?;
        Database::with_connection(connection, Arc::new(SqliteDialect))
    }

    /// Builder with [`COMPONENT`] registered and short lock waits.
    pub fn builder(&self) -> DarwinBuilder {
        Darwin::builder()
            .component(COMPONENT, Arc::new(self.scripts()))
            .lock_wait(Duration::from_millis(20))
    }

    /// A Darwin instance on its own connection.
    pub fn member(&self) -> DarwinResult<Darwin> {
        self.builder().open_path(&self.path)
    }

    /// Runs `sql` on a separate connection and returns the count it selects.
    pub fn count(&self, sql: &str) -> DarwinResult<i64> {
        self.connection()?.query_count(sql)
    }

    pub fn table_exists(&self, table: &str) -> DarwinResult<bool> {
        self.connection()?.table_exists(table)
    }

    /// Whether `name` is recorded as a finished patch of `component`.
    pub fn is_finished(&self, name: &str, component: &str) -> DarwinResult<bool> {
        let count = self.count(&format!(
            "SELECT COUNT(*) FROM darwin_patch WHERE patch_name = '{}' AND component = '{}' AND finished_on IS NOT NULL",
            name, component
        ))?;
        Ok(count == 1)
    }
}

pub fn create_test_context() -> DarwinResult<TestContext> {
    let dir = tempfile::tempdir().map_err(|e| {
        DarwinError::new(
            &format!("Failed to create test directory: {}", e),
            ErrorKind::IOError,
        )
    })?;
    log::debug!("Test database directory {:?}", dir.path());
    Ok(TestContext::new(dir))
}

pub fn cleanup(ctx: TestContext) -> DarwinResult<()> {
    // the directory goes away with the last clone of the context
    log::debug!("Releasing test database {:?}", ctx.path());
    drop(ctx);
    Ok(())
}

