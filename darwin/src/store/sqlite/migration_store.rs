use crate::common::{from_millis, to_millis};
use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use crate::patch::{Patch, StatementRecord, StatementStatus};
use crate::store::{Database, MigrationStore, COMPONENT_TABLE};
use crate::version::VersionDescriptor;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

/// [`MigrationStore`] over the `darwin`, `darwin_patch` and `darwin_sql`
/// tables, with SQL taken from the database's dialect.
#[derive(Clone)]
pub struct SqliteMigrationStore {
    database: Database,
}

impl SqliteMigrationStore {
    pub fn new(database: Database) -> SqliteMigrationStore {
        SqliteMigrationStore { database }
    }

    fn insert_patch(&self, patch: &Patch) -> rusqlite::Result<i64> {
        let sql = self.database.dialect().insert_patch();
        self.database.run_raw(|conn| {
            conn.execute(
                sql,
                params![
                    patch.name(),
                    patch.component(),
                    patch.platform(),
                    to_millis(&patch.detected_on())
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn ensure_component(&self, component: &str) -> DarwinResult<()> {
        let sql = self.database.dialect().insert_component();
        let now = to_millis(&Utc::now());
        self.database
            .run(|conn| conn.execute(sql, params![component, now]))?;
        Ok(())
    }

    fn fetch_existing(&self, patch: &Patch) -> DarwinResult<Patch> {
        self.find_patch(patch.name(), patch.component(), patch.platform())?
            .ok_or_else(|| {
                DarwinError::new(
                    &format!("Patch {} vanished after a duplicate insert", patch),
                    ErrorKind::InternalError,
                )
            })
    }

    fn insert_or_collapse(&self, patch: &Patch) -> Result<Patch, rusqlite::Error> {
        self.insert_patch(patch).map(|id| patch.clone().with_id(id))
    }

    fn count(&self, sql: &str, params: impl rusqlite::Params) -> DarwinResult<i64> {
        self.database
            .run(|conn| conn.query_row(sql, params, |row| row.get::<_, i64>(0)))
    }

    fn write_statement(&self, sql: &str, record: &StatementRecord) -> DarwinResult<usize> {
        let finished_on = record.finished_on().map(|at| to_millis(&at));
        self.database.run(|conn| {
            conn.execute(
                sql,
                params![
                    record.patch_id(),
                    record.hash(),
                    record.occurrence(),
                    record.statement(),
                    finished_on,
                    record.process_time(),
                    record.failure()
                ],
            )
        })
    }
}

impl MigrationStore for SqliteMigrationStore {
    fn get_version(&self, component: &str) -> DarwinResult<Option<VersionDescriptor>> {
        if !self.database.table_exists(COMPONENT_TABLE)? {
            return Ok(None);
        }

        let sql = self.database.dialect().select_version();
        let version: Option<Option<String>> = self.database.run(|conn| {
            conn.query_row(sql, [component], |row| row.get::<_, Option<String>>(0))
                .optional()
        })?;

        match version.flatten() {
            Some(text) => Ok(Some(VersionDescriptor::parse(&text)?)),
            None => Ok(None),
        }
    }

    fn update_version(&self, component: &str, version: &VersionDescriptor) -> DarwinResult<()> {
        let sql = self.database.dialect().upsert_version();
        let now = to_millis(&Utc::now());
        self.database
            .run(|conn| conn.execute(sql, params![component, version.original(), now]))?;
        log::debug!("Recorded version {} for component {}", version, component);
        Ok(())
    }

    fn insert_or_fetch_patch(&self, patch: &Patch) -> DarwinResult<Patch> {
        if let Some(existing) = self.find_patch(patch.name(), patch.component(), patch.platform())? {
            return Ok(existing);
        }

        let dialect = self.database.dialect();
        match self.insert_or_collapse(patch) {
            Ok(persisted) => Ok(persisted),
            Err(e) if dialect.is_unique_violation(&e) => {
                log::debug!("Patch {} inserted concurrently, fetching it", patch);
                self.fetch_existing(patch)
            }
            Err(e) if dialect.is_foreign_key_violation(&e) => {
                log::debug!("Component {} not recorded yet, creating it", patch.component());
                self.ensure_component(patch.component())?;
                match self.insert_or_collapse(patch) {
                    Ok(persisted) => Ok(persisted),
                    Err(e) if dialect.is_unique_violation(&e) => self.fetch_existing(patch),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find_patch(&self, name: &str, component: &str, platform: &str) -> DarwinResult<Option<Patch>> {
        let sql = self.database.dialect().select_patch();
        let row = self.database.run(|conn| {
            conn.query_row(sql, params![name, component, platform], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })
            .optional()
        })?;

        match row {
            Some((id, detected_on, process_time, finished_on)) => Ok(Some(Patch::restore(
                id,
                name,
                component,
                platform,
                from_millis(detected_on),
                process_time,
                finished_on.map(from_millis),
            )?)),
            None => Ok(None),
        }
    }

    fn mark_patch_finished(&self, patch: &Patch) -> DarwinResult<()> {
        let Some(id) = patch.id() else {
            log::debug!("Patch {} is virtual, not recording it as finished", patch);
            return Ok(());
        };

        let finished_on = to_millis(&patch.finished_on().unwrap_or_else(Utc::now));
        let sql = self.database.dialect().finish_patch();
        self.database
            .run(|conn| conn.execute(sql, params![finished_on, patch.process_time(), id]))?;
        Ok(())
    }

    fn is_patch_finished(&self, patch: &Patch) -> DarwinResult<bool> {
        let dialect = self.database.dialect();
        let count = match patch.id() {
            Some(id) => self.count(dialect.count_finished_patch_by_id(), [id])?,
            None => self.count(
                dialect.count_finished_patch_by_name(),
                params![patch.name(), patch.component(), patch.platform()],
            )?,
        };
        Ok(count > 0)
    }

    fn has_any_patch(&self, component: &str) -> DarwinResult<bool> {
        let count = self.count(self.database.dialect().count_component_patches(), [component])?;
        Ok(count > 0)
    }

    fn is_patch_recorded(&self, name: &str, component: &str) -> DarwinResult<bool> {
        let count = self.count(
            self.database.dialect().count_named_patches(),
            params![name, component],
        )?;
        Ok(count > 0)
    }

    fn insert_statement(&self, record: &StatementRecord) -> DarwinResult<()> {
        self.write_statement(self.database.dialect().upsert_statement(), record)?;
        Ok(())
    }

    fn update_statement(&self, record: &StatementRecord) -> DarwinResult<()> {
        let updated = self.write_statement(self.database.dialect().update_statement(), record)?;
        if updated == 0 {
            self.insert_statement(record)?;
        }
        Ok(())
    }

    fn statement_status(&self, patch_id: i64, hash: &str, occurrence: u32) -> DarwinResult<StatementStatus> {
        let sql = self.database.dialect().select_statement_status();
        let row = self.database.run(|conn| {
            conn.query_row(sql, params![patch_id, hash, occurrence], |row| {
                Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .optional()
        })?;

        Ok(match row {
            None => StatementStatus::NeverRun,
            Some((Some(_), _)) => StatementStatus::Finished,
            Some((None, _)) => StatementStatus::Failed,
        })
    }

    fn bookkeeping_tables_exist(&self) -> DarwinResult<bool> {
        let dialect = self.database.dialect();
        let exists = self.database.query_count(dialect.probe_patch_table()).is_ok()
            && self.database.query_count(dialect.probe_statement_table()).is_ok();
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{statement_hash, tokenize};
    use crate::store::sqlite::CREATE_SCRIPT;

    fn store() -> (Database, SqliteMigrationStore) {
        let db = Database::open_in_memory().unwrap();
        (db.clone(), SqliteMigrationStore::new(db))
    }

    fn bootstrap(db: &Database) {
        for statement in tokenize(CREATE_SCRIPT).unwrap() {
            db.execute(&statement).unwrap();
        }
    }

    #[test]
    fn test_version_without_tables() {
        let (_, store) = store();
        assert_eq!(store.get_version("shop").unwrap(), None);
        assert!(!store.bookkeeping_tables_exist().unwrap());
    }

    #[test]
    fn test_update_and_get_version() {
        let (db, store) = store();
        bootstrap(&db);
        assert_eq!(store.get_version("shop").unwrap(), None);

        store
            .update_version("shop", &VersionDescriptor::parse("1.0").unwrap())
            .unwrap();
        store
            .update_version("shop", &VersionDescriptor::parse("2.0.1").unwrap())
            .unwrap();
        let version = store.get_version("shop").unwrap().unwrap();
        assert_eq!(version.original(), "2.0.1");
        assert!(store.bookkeeping_tables_exist().unwrap());
    }

    #[test]
    fn test_insert_or_fetch_creates_component_row() {
        let (db, store) = store();
        bootstrap(&db);

        let patch = Patch::new("patch_1.sql", "shop", "sqlite").unwrap();
        let persisted = store.insert_or_fetch_patch(&patch).unwrap();
        assert!(persisted.is_persisted());
        // the component row exists but carries no version yet
        assert_eq!(store.get_version("shop").unwrap(), None);
        assert_eq!(
            db.query_count("SELECT COUNT(*) FROM darwin WHERE component = 'shop'").unwrap(),
            1
        );

        let again = store.insert_or_fetch_patch(&patch).unwrap();
        assert_eq!(again.id(), persisted.id());
        assert!(store.has_any_patch("shop").unwrap());
        assert!(store.is_patch_recorded("patch_1.sql", "shop").unwrap());
        assert!(!store.is_patch_recorded("patch_2.sql", "shop").unwrap());
    }

    #[test]
    fn test_duplicate_insert_collapses_to_fetch() {
        let (db, store) = store();
        bootstrap(&db);
        let patch = Patch::new("patch_1.sql", "shop", "sqlite").unwrap();
        let first = store.insert_or_fetch_patch(&patch).unwrap();

        // a concurrent writer would hit the unique key
        let err = store.insert_patch(&patch).unwrap_err();
        assert!(db.dialect().is_unique_violation(&err));
        assert_eq!(store.fetch_existing(&patch).unwrap().id(), first.id());
    }

    #[test]
    fn test_mark_patch_finished() {
        let (db, store) = store();
        bootstrap(&db);

        let virtual_patch = Patch::new("create.sql", "shop", "sqlite").unwrap();
        store.mark_patch_finished(&virtual_patch).unwrap();
        assert!(!store.is_patch_finished(&virtual_patch).unwrap());

        let mut persisted = store.insert_or_fetch_patch(&virtual_patch).unwrap();
        assert!(!store.is_patch_finished(&persisted).unwrap());
        persisted.finish(12, Utc::now());
        store.mark_patch_finished(&persisted).unwrap();
        assert!(store.is_patch_finished(&persisted).unwrap());
        // lookup by name also sees it
        assert!(store.is_patch_finished(&virtual_patch).unwrap());

        let reloaded = store.find_patch("create.sql", "shop", "sqlite").unwrap().unwrap();
        assert_eq!(reloaded.process_time(), 12);
        assert!(reloaded.is_finished());
    }

    #[test]
    fn test_statement_status_lifecycle() {
        let (db, store) = store();
        bootstrap(&db);
        let patch = store
            .insert_or_fetch_patch(&Patch::new("patch_1.sql", "shop", "sqlite").unwrap())
            .unwrap();
        let patch_id = patch.id().unwrap();
        let hash = statement_hash("create table a (id int)");

        assert_eq!(store.statement_status(patch_id, &hash, 0).unwrap(), StatementStatus::NeverRun);

        let mut record = StatementRecord::new(patch_id, "create table a (id int)", &hash, 0);
        record.set_finished_on(Some(Utc::now()));
        store.insert_statement(&record).unwrap();
        assert_eq!(store.statement_status(patch_id, &hash, 0).unwrap(), StatementStatus::Finished);
        assert_eq!(store.statement_status(patch_id, &hash, 1).unwrap(), StatementStatus::NeverRun);

        record.set_finished_on(None);
        record.set_failure(Some("table a already exists".to_string()));
        store.update_statement(&record).unwrap();
        assert_eq!(store.statement_status(patch_id, &hash, 0).unwrap(), StatementStatus::Failed);

        // writing the same statement again replaces the row
        record.set_finished_on(Some(Utc::now()));
        record.set_failure(None);
        store.insert_statement(&record).unwrap();
        assert_eq!(store.statement_status(patch_id, &hash, 0).unwrap(), StatementStatus::Finished);
        assert_eq!(db.query_count("SELECT COUNT(*) FROM darwin_sql").unwrap(), 1);
    }

    #[test]
    fn test_update_statement_writes_missing_row() {
        let (db, store) = store();
        bootstrap(&db);
        let patch = store
            .insert_or_fetch_patch(&Patch::new("patch_1.sql", "shop", "sqlite").unwrap())
            .unwrap();
        let mut record = StatementRecord::new(patch.id().unwrap(), "select 1", &statement_hash("select 1"), 0);
        record.set_failure(Some("boom".to_string()));
        store.update_statement(&record).unwrap();
        assert_eq!(
            store
                .statement_status(patch.id().unwrap(), record.hash(), 0)
                .unwrap(),
            StatementStatus::Failed
        );
    }
}
