use crate::common::duration_millis;
use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use crate::patch::{Patch, StatementRecord, StatementStatus};
use crate::resource::ResourceProvider;
use crate::script::statement_hash;
use crate::store::{BookkeepingDetector, Database, MigrationStore, TransactionScope};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Applies one patch statement by statement.
///
/// With bookkeeping tables present, every statement of a persisted patch is
/// recorded under its content hash and occurrence index, so running a patch
/// again after a failure resumes at the first statement that did not finish.
#[derive(Clone)]
pub struct PatchExecutor {
    database: Database,
    store: Arc<dyn MigrationStore>,
    bookkeeping: BookkeepingDetector,
    transactional: bool,
}

impl PatchExecutor {
    pub fn new(
        database: Database,
        store: Arc<dyn MigrationStore>,
        bookkeeping: BookkeepingDetector,
        transactional: bool,
    ) -> PatchExecutor {
        PatchExecutor {
            database,
            store,
            bookkeeping,
            transactional,
        }
    }

    /// Applies the resource at `path` to `component` and returns the patch,
    /// finished.
    pub fn execute(&self, provider: &dyn ResourceProvider, path: &str, component: &str) -> DarwinResult<Patch> {
        self.execute_then(provider, path, component, |_| Ok(()))
    }

    /// Like [`PatchExecutor::execute`], running `then` in the same
    /// transaction once every statement succeeded. A failing `then` rolls
    /// the patch back.
    pub fn execute_then<F>(
        &self,
        provider: &dyn ResourceProvider,
        path: &str,
        component: &str,
        then: F,
    ) -> DarwinResult<Patch>
    where
        F: FnOnce(&Patch) -> DarwinResult<()>,
    {
        let statements = provider.tokenize(path)?;
        let patch = Patch::for_path(path, component)?;

        // identity is settled before the patch runs, so a failed statement
        // always has a patch row to attach to
        let bookkeeping = self.bookkeeping.exists()?;
        let patch = if bookkeeping {
            self.database
                .in_transaction(|_| self.store.insert_or_fetch_patch(&patch))?
        } else {
            patch
        };

        log::info!("Applying patch {} ({} statements)", patch, statements.len());
        let patch = self.database.in_scope(self.transactional, |scope| {
            let patch = self.apply(scope, patch, &statements, bookkeeping)?;
            then(&patch)?;
            Ok(patch)
        })?;
        log::info!("Patch {} applied in {} ms", patch, patch.process_time());
        Ok(patch)
    }

    fn apply(
        &self,
        scope: &TransactionScope<'_>,
        mut patch: Patch,
        statements: &[String],
        bookkeeping: bool,
    ) -> DarwinResult<Patch> {
        let started = Instant::now();
        let tracked = if bookkeeping { patch.id() } else { None };
        let mut occurrences: HashMap<&str, u32> = HashMap::new();

        for statement in statements {
            let counter = occurrences.entry(statement.as_str()).or_insert(0);
            let occurrence = *counter;
            *counter += 1;

            let hash = statement_hash(statement);
            if let Some(patch_id) = tracked {
                if self.store.statement_status(patch_id, &hash, occurrence)? == StatementStatus::Finished {
                    log::debug!("Skipping finished statement #{} of {}: {}", occurrence, patch, statement);
                    continue;
                }
            }

            let mut record = tracked.map(|patch_id| StatementRecord::new(patch_id, statement, &hash, occurrence));
            if let Some(record) = record.as_mut() {
                record.set_finished_on(Some(Utc::now()));
                self.store.insert_statement(record)?;
            }

            let statement_started = Instant::now();
            match self.database.execute(statement) {
                Ok(_) => {
                    if let Some(record) = record.as_mut() {
                        record.set_process_time(duration_millis(statement_started.elapsed()));
                        self.store.update_statement(record)?;
                    }
                }
                Err(e) => {
                    log::error!("Statement of patch {} failed: {}\n{}", patch, e, statement);
                    if let Some(mut record) = record {
                        record.set_finished_on(None);
                        record.set_process_time(duration_millis(statement_started.elapsed()));
                        record.set_failure(Some(e.to_string()));
                        self.record_failure_on_rollback(scope, record);
                    }
                    return Err(DarwinError::new_with_cause(
                        &format!("Patch {} failed executing statement: {}", patch, statement),
                        ErrorKind::ExecutionError,
                        e,
                    ));
                }
            }
        }

        patch.finish(duration_millis(started.elapsed()), Utc::now());
        if tracked.is_some() {
            self.store.mark_patch_finished(&patch)?;
        }
        Ok(patch)
    }

    fn record_failure_on_rollback(&self, scope: &TransactionScope<'_>, record: StatementRecord) {
        let database = self.database.clone();
        let store = self.store.clone();
        scope.on_rollback(move || {
            if let Err(e) = database.in_transaction(|_| store.update_statement(&record)) {
                log::error!(
                    "Failed to record failure of statement #{} of patch {}: {}",
                    record.occurrence(),
                    record.patch_id(),
                    e
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MemoryResourceProvider;
    use crate::script::tokenize;
    use crate::store::sqlite::CREATE_SCRIPT;
    use crate::store::SqliteMigrationStore;

    struct Fixture {
        db: Database,
        store: Arc<dyn MigrationStore>,
        executor: PatchExecutor,
    }

    fn fixture(bootstrap: bool, transactional: bool) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        if bootstrap {
            for statement in tokenize(CREATE_SCRIPT).unwrap() {
                db.execute(&statement).unwrap();
            }
        }
        let store: Arc<dyn MigrationStore> = Arc::new(SqliteMigrationStore::new(db.clone()));
        let executor = PatchExecutor::new(
            db.clone(),
            store.clone(),
            BookkeepingDetector::new(store.clone()),
            transactional,
        );
        Fixture { db, store, executor }
    }

    fn count(db: &Database, sql: &str) -> i64 {
        db.query_count(sql).unwrap()
    }

    #[test]
    fn test_execute_without_bookkeeping() {
        let f = fixture(false, true);
        let provider = MemoryResourceProvider::new().with(
            "sqlite/create.sql",
            "create table a (id integer);\ninsert into a values (1);",
        );
        let patch = f.executor.execute(&provider, "sqlite/create.sql", "shop").unwrap();
        assert!(!patch.is_persisted());
        assert!(patch.is_finished());
        assert_eq!(count(&f.db, "select count(*) from a"), 1);
    }

    #[test]
    fn test_execute_records_statements() {
        let f = fixture(true, true);
        let provider = MemoryResourceProvider::new().with(
            "sqlite/patch_1.sql",
            "create table a (id integer);\ninsert into a values (1);",
        );
        let patch = f.executor.execute(&provider, "sqlite/patch_1.sql", "shop").unwrap();
        assert!(patch.is_persisted());
        assert!(f.store.is_patch_finished(&patch).unwrap());
        assert_eq!(count(&f.db, "select count(*) from darwin_sql where finished_on is not null"), 2);
    }

    #[test]
    fn test_failure_rolls_back_and_records_failure() {
        let f = fixture(true, true);
        let provider = MemoryResourceProvider::new().with(
            "sqlite/patch_1.sql",
            "create table a (id integer);\ninsert into a values (1);\ninsert into missing values (1);",
        );
        let err = f
            .executor
            .execute(&provider, "sqlite/patch_1.sql", "shop")
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ExecutionError);
        assert!(err.message().contains("insert into missing"));

        // the whole patch rolled back, only the failure survived
        assert!(!f.db.table_exists("a").unwrap());
        assert_eq!(count(&f.db, "select count(*) from darwin_sql"), 1);
        assert_eq!(
            count(&f.db, "select count(*) from darwin_sql where finished_on is null and failure is not null"),
            1
        );
        let patch = f.store.find_patch("patch_1.sql", "shop", "sqlite").unwrap().unwrap();
        assert!(!patch.is_finished());
    }

    #[test]
    fn test_resume_after_failure_in_autocommit_mode() {
        let f = fixture(true, false);
        f.db.execute("create table log (n integer)").unwrap();
        let provider = MemoryResourceProvider::new().with(
            "sqlite/patch_1.sql",
            "insert into log values (1);\ninsert into log values (2);\ninsert into target values (3);",
        );

        assert!(f.executor.execute(&provider, "sqlite/patch_1.sql", "shop").is_err());
        assert_eq!(count(&f.db, "select count(*) from log"), 2);

        f.db.execute("create table target (n integer)").unwrap();
        let patch = f.executor.execute(&provider, "sqlite/patch_1.sql", "shop").unwrap();
        assert!(patch.is_finished());
        // statements 1 and 2 were not run a second time
        assert_eq!(count(&f.db, "select count(*) from log"), 2);
        assert_eq!(count(&f.db, "select count(*) from target"), 1);
        assert_eq!(count(&f.db, "select count(*) from darwin_sql where failure is null"), 3);
    }

    #[test]
    fn test_duplicate_statements_run_each_time() {
        let f = fixture(true, true);
        f.db.execute("create table counter (n integer)").unwrap();
        let provider = MemoryResourceProvider::new().with(
            "sqlite/patch_1.sql",
            "insert into counter values (1);\ninsert into counter values (1);\ninsert into counter values (1);",
        );
        f.executor.execute(&provider, "sqlite/patch_1.sql", "shop").unwrap();
        assert_eq!(count(&f.db, "select count(*) from counter"), 3);
        assert_eq!(count(&f.db, "select count(distinct occurrence) from darwin_sql"), 3);

        // running the finished patch again changes nothing
        f.executor.execute(&provider, "sqlite/patch_1.sql", "shop").unwrap();
        assert_eq!(count(&f.db, "select count(*) from counter"), 3);
    }

    #[test]
    fn test_resume_runs_only_the_failed_copy_of_a_duplicate_statement() {
        let f = fixture(true, false);
        f.db.execute("create table counter (n integer)").unwrap();
        f.db.execute(
            "create trigger counter_full before insert on counter \
             when (select count(*) from counter) >= 1 \
             begin select raise(abort, 'counter full'); end",
        )
        .unwrap();
        let provider = MemoryResourceProvider::new().with(
            "sqlite/patch_1.sql",
            "insert into counter values (1);\ninsert into counter values (1);",
        );

        let err = f
            .executor
            .execute(&provider, "sqlite/patch_1.sql", "shop")
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ExecutionError);
        assert_eq!(count(&f.db, "select count(*) from counter"), 1);
        assert_eq!(
            count(&f.db, "select count(*) from darwin_sql where occurrence = 1 and failure is not null"),
            1
        );

        f.db.execute("drop trigger counter_full").unwrap();
        let patch = f.executor.execute(&provider, "sqlite/patch_1.sql", "shop").unwrap();
        assert!(patch.is_finished());
        // occurrence 0 finished the first time and is skipped
        assert_eq!(count(&f.db, "select count(*) from counter"), 2);
        assert_eq!(
            count(&f.db, "select count(*) from darwin_sql where failure is null and finished_on is not null"),
            2
        );
    }

    #[test]
    fn test_failing_follow_up_rolls_back_patch() {
        let f = fixture(true, true);
        let provider = MemoryResourceProvider::new().with(
            "sqlite/patch_1.sql",
            "create table a (id integer);\ninsert into a values (1);",
        );

        let err = f
            .executor
            .execute_then(&provider, "sqlite/patch_1.sql", "shop", |patch| {
                assert!(patch.is_finished());
                Err(DarwinError::new("version not recorded", ErrorKind::BackendError))
            })
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::BackendError);
        assert!(!f.db.table_exists("a").unwrap());
        let patch = f.store.find_patch("patch_1.sql", "shop", "sqlite").unwrap().unwrap();
        assert!(!patch.is_finished());

        let patch = f
            .executor
            .execute_then(&provider, "sqlite/patch_1.sql", "shop", |_| {
                f.db.execute("create table done (id integer)").map(|_| ())
            })
            .unwrap();
        assert!(f.store.is_patch_finished(&patch).unwrap());
        assert!(f.db.table_exists("a").unwrap());
        assert!(f.db.table_exists("done").unwrap());
    }

    #[test]
    fn test_statement_format_error() {
        let f = fixture(true, true);
        let provider = MemoryResourceProvider::new().with("sqlite/patch_1.sql", "select 'oops");
        let err = f
            .executor
            .execute(&provider, "sqlite/patch_1.sql", "shop")
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::StatementFormat);
        assert!(f.store.find_patch("patch_1.sql", "shop", "sqlite").unwrap().is_none());
    }
}
