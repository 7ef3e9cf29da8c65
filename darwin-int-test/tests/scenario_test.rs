use darwin::errors::ErrorKind;
use darwin::resource::DirectoryResourceProvider;
use darwin::version::VersionDescriptor;
use darwin_int_test::test_util::{cleanup, create_test_context, run_test, COMPONENT};
use std::fs;

#[ctor::ctor]
fn init() {
    colog::init();
}

fn v(text: &str) -> Option<VersionDescriptor> {
    Some(VersionDescriptor::parse(text).unwrap())
}

#[test]
fn test_create_on_empty_database() {
    run_test(
        create_test_context,
        |ctx| {
            ctx.script("create.sql", "CREATE TABLE item (id INTEGER PRIMARY KEY, kind TEXT);");
            let darwin = ctx.member()?;
            darwin.migrate(COMPONENT, "1.0")?;

            for table in ["darwin", "darwin_patch", "darwin_sql", "darwin_lock", "item"] {
                assert!(ctx.table_exists(table)?, "missing table {}", table);
            }
            assert_eq!(darwin.version(COMPONENT)?, v("1.0"));
            assert!(ctx.is_finished("create.sql", COMPONENT)?);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_backfill_of_recorded_version() {
    run_test(
        create_test_context,
        |ctx| {
            ctx.script("patch_1.0.sql", "CREATE TABLE item (id INTEGER PRIMARY KEY);")
                .script("patch_2.0.sql", "CREATE TABLE other (id INTEGER PRIMARY KEY);");

            // a schema at 1.0 recorded before patches were tracked
            let darwin = ctx.member()?;
            let db = ctx.connection()?;
            db.execute("CREATE TABLE item (id INTEGER PRIMARY KEY)")?;
            db.execute("INSERT INTO darwin (component, version, modified) VALUES ('shop', '1.0', 0)")?;

            darwin.migrate(COMPONENT, "2.0")?;

            assert!(ctx.is_finished("patch_1.0.sql", COMPONENT)?);
            assert!(ctx.is_finished("patch_2.0.sql", COMPONENT)?);
            assert!(ctx.table_exists("other")?);
            // patch_1.0 was recorded, never run
            assert_eq!(
                ctx.count("SELECT COUNT(*) FROM darwin_sql WHERE statement LIKE 'CREATE TABLE item%'")?,
                0
            );
            assert_eq!(darwin.version(COMPONENT)?, v("2.0"));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_guess_confirms_patch() {
    run_test(
        create_test_context,
        |ctx| {
            ctx.script("create.sql", "CREATE TABLE t (id INTEGER PRIMARY KEY, col TEXT);")
                .script("guess_1.1.sql", "select count(*) from t where col='b';")
                .script("patch_1.1.sql", "DROP TABLE t;");

            let darwin = ctx.member()?;
            darwin.migrate(COMPONENT, "1.0")?;
            ctx.connection()?.execute("INSERT INTO t (col) VALUES ('b')")?;

            darwin.migrate(COMPONENT, "1.1")?;

            assert_eq!(darwin.version(COMPONENT)?, v("1.1"));
            assert!(ctx.table_exists("t")?, "patch_1.1.sql must not run");
            assert!(ctx.is_finished("patch_1.1.sql", COMPONENT)?);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_guess_version_of_untracked_schema() {
    run_test(
        create_test_context,
        |ctx| {
            ctx.script("create.sql", "CREATE TABLE t (id INTEGER PRIMARY KEY, col TEXT);")
                .script("guess_1.0.sql", "select count(*) from sqlite_master where name = 't';")
                .script("guess_1.1.sql", "select count(*) from t where col = 'b';")
                .script("patch_1.1.sql", "INSERT INTO t (col) VALUES ('b');")
                .script("patch_1.2.sql", "CREATE TABLE u (id INTEGER PRIMARY KEY);");

            // built by hand at 1.0, never seen by darwin
            let db = ctx.connection()?;
            db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, col TEXT)")?;

            let darwin = ctx.member()?;
            darwin.migrate(COMPONENT, "1.2")?;

            assert_eq!(darwin.version(COMPONENT)?, v("1.2"));
            // create.sql never ran, patch_1.1 did
            assert_eq!(ctx.count("SELECT COUNT(*) FROM t WHERE col = 'b'")?, 1);
            assert!(ctx.table_exists("u")?);
            assert!(ctx.is_finished("create.sql", COMPONENT)?);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_out_of_order_patch_from_branch() {
    run_test(
        create_test_context,
        |ctx| {
            ctx.script("create.sql", "CREATE TABLE item (id INTEGER PRIMARY KEY);")
                .script("patch_1.1.sql", "CREATE TABLE a (id INTEGER);")
                .script("patch_1.3.sql", "CREATE TABLE c (id INTEGER);");

            let darwin = ctx.member()?;
            darwin.migrate(COMPONENT, "1.0")?;
            darwin.migrate(COMPONENT, "1.3")?;
            assert!(ctx.table_exists("a")? && ctx.table_exists("c")?);

            ctx.script("patch_1.2.sql", "CREATE TABLE b (id INTEGER);");
            let restarted = ctx.member()?;
            restarted.migrate(COMPONENT, "1.3")?;

            assert!(ctx.table_exists("b")?);
            assert!(ctx.is_finished("patch_1.2.sql", COMPONENT)?);
            assert_eq!(restarted.version(COMPONENT)?, v("1.3"));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_failed_patch_is_recorded_and_rolled_back() {
    run_test(
        create_test_context,
        |ctx| {
            ctx.script("create.sql", "CREATE TABLE item (id INTEGER PRIMARY KEY);")
                .script(
                    "patch_1.1.sql",
                    "CREATE TABLE a (id INTEGER);\nINSERT INTO missing VALUES (1);",
                );

            let darwin = ctx.member()?;
            darwin.migrate(COMPONENT, "1.0")?;

            let err = darwin.migrate(COMPONENT, "1.1").unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::ExecutionError);
            assert!(err.message().contains("patch_1.1.sql"));
            assert!(err.message().contains("INSERT INTO missing"));

            assert!(!ctx.table_exists("a")?);
            assert_eq!(darwin.version(COMPONENT)?, v("1.0"));
            assert_eq!(
                ctx.count("SELECT COUNT(*) FROM darwin_sql WHERE failure IS NOT NULL AND finished_on IS NULL")?,
                1
            );

            // fixed and run again
            ctx.script("patch_1.1.sql", "CREATE TABLE a (id INTEGER);");
            darwin.migrate(COMPONENT, "1.1")?;
            assert!(ctx.table_exists("a")?);
            assert_eq!(darwin.version(COMPONENT)?, v("1.1"));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_resume_half_applied_patch() {
    run_test(
        create_test_context,
        |ctx| {
            ctx.script("create.sql", "CREATE TABLE log (n INTEGER);")
                .script(
                    "patch_1.1.sql",
                    "INSERT INTO log VALUES (1);\nINSERT INTO log VALUES (2);\nINSERT INTO target VALUES (3);",
                );

            let darwin = ctx.builder().transactional(false).open_path(ctx.path())?;
            darwin.migrate(COMPONENT, "1.0")?;
            assert!(darwin.migrate(COMPONENT, "1.1").is_err());
            assert_eq!(ctx.count("SELECT COUNT(*) FROM log")?, 2);

            ctx.connection()?.execute("CREATE TABLE target (n INTEGER)")?;
            darwin.migrate(COMPONENT, "1.1")?;

            assert_eq!(ctx.count("SELECT COUNT(*) FROM log")?, 2);
            assert_eq!(ctx.count("SELECT COUNT(*) FROM target")?, 1);
            assert_eq!(darwin.version(COMPONENT)?, v("1.1"));

            // nothing left to do
            darwin.migrate(COMPONENT, "1.1")?;
            assert_eq!(ctx.count("SELECT COUNT(*) FROM log")?, 2);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_duplicate_statements_each_run_once() {
    run_test(
        create_test_context,
        |ctx| {
            ctx.script("create.sql", "CREATE TABLE counter (n INTEGER);")
                .script(
                    "patch_1.1.sql",
                    "INSERT INTO counter VALUES (1);\nINSERT INTO counter VALUES (1);\nINSERT INTO counter VALUES (1);",
                );

            let darwin = ctx.member()?;
            darwin.migrate(COMPONENT, "1.1")?;
            // create.sql stands for 1.1 already
            assert_eq!(ctx.count("SELECT COUNT(*) FROM counter")?, 0);

            let fresh = create_test_context()?;
            fresh
                .script("patch_1.0.sql", "CREATE TABLE counter (n INTEGER);")
                .script(
                    "patch_1.1.sql",
                    "INSERT INTO counter VALUES (1);\nINSERT INTO counter VALUES (1);\nINSERT INTO counter VALUES (1);",
                );
            let darwin = fresh.member()?;
            darwin.migrate(COMPONENT, "1.1")?;
            darwin.migrate(COMPONENT, "1.1")?;

            assert_eq!(fresh.count("SELECT COUNT(*) FROM counter")?, 3);
            assert_eq!(
                fresh.count("SELECT COUNT(DISTINCT occurrence) FROM darwin_sql WHERE statement LIKE 'INSERT%'")?,
                3
            );
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_resume_after_failed_duplicate_statement() {
    run_test(
        create_test_context,
        |ctx| {
            ctx.script("create.sql", "CREATE TABLE counter (n INTEGER);")
                .script(
                    "patch_1.1.sql",
                    "INSERT INTO counter VALUES (1);\nINSERT INTO counter VALUES (1);",
                );

            let darwin = ctx.builder().transactional(false).open_path(ctx.path())?;
            darwin.migrate(COMPONENT, "1.0")?;

            // lets the first insert through and aborts the second
            ctx.connection()?.execute(
                "CREATE TRIGGER counter_full BEFORE INSERT ON counter \
                 WHEN (SELECT COUNT(*) FROM counter) >= 1 \
                 BEGIN SELECT RAISE(ABORT, 'counter full'); END",
            )?;
            let err = darwin.migrate(COMPONENT, "1.1").unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::ExecutionError);
            assert_eq!(ctx.count("SELECT COUNT(*) FROM counter")?, 1);
            assert_eq!(darwin.version(COMPONENT)?, v("1.0"));

            ctx.connection()?.execute("DROP TRIGGER counter_full")?;
            darwin.migrate(COMPONENT, "1.1")?;

            assert_eq!(ctx.count("SELECT COUNT(*) FROM counter")?, 2);
            assert_eq!(darwin.version(COMPONENT)?, v("1.1"));
            assert!(ctx.is_finished("patch_1.1.sql", COMPONENT)?);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_scripts_from_directory() {
    run_test(
        create_test_context,
        |ctx| {
            let root = ctx.dir().join("scripts");
            fs::create_dir_all(root.join("sqlite"))?;
            fs::create_dir_all(root.join("postgresql"))?;
            fs::write(
                root.join("sqlite").join("create.sql"),
                "-- item table\nCREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT);\n",
            )?;
            fs::write(
                root.join("sqlite").join("patch_2.0.sql"),
                "ALTER TABLE item ADD COLUMN price INTEGER; /* cents */\nINSERT INTO item (name, price) VALUES ('a;b', 1);",
            )?;
            fs::write(root.join("sqlite").join("readme.txt"), "not a script")?;
            fs::write(
                root.join("postgresql").join("create.sql"),
                "CREATE TABLE item (id SERIAL PRIMARY KEY);",
            )?;

            let darwin = ctx.member()?;
            let provider = DirectoryResourceProvider::new(&root);
            darwin.migrate_with("catalog", "1.0", &provider)?;
            darwin.migrate_with("catalog", "2.0", &provider)?;

            assert_eq!(darwin.version("catalog")?, v("2.0"));
            assert_eq!(ctx.count("SELECT COUNT(*) FROM item WHERE name = 'a;b' AND price = 1")?, 1);
            Ok(())
        },
        cleanup,
    )
}
