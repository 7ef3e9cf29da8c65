use darwin::errors::DarwinResult;
use darwin_int_test::test_util::{cleanup, create_test_context, COMPONENT};

fn main() -> DarwinResult<()> {
    println!("Starting stress test...");
    let ctx = create_test_context()?;

    let patches = 500;
    let rows_per_patch = 20;
    ctx.script("patch_1.sql", "CREATE TABLE stress (patch INTEGER, seq INTEGER, note TEXT);");
    for patch in 2..=patches {
        let statements: Vec<String> = (0..rows_per_patch)
            .map(|seq| format!("INSERT INTO stress VALUES ({}, {}, 'row;{}');", patch, seq, seq))
            .collect();
        ctx.script(&format!("patch_{}.sql", patch), &statements.join("\n"));
    }

    let start = std::time::Instant::now();
    let darwin = ctx.member()?;
    println!("Initialized bookkeeping in {:?}", start.elapsed());

    let start = std::time::Instant::now();
    darwin.migrate(COMPONENT, &patches.to_string())?;
    println!("Applied {} patches in {:?}", patches, start.elapsed());

    let start = std::time::Instant::now();
    darwin.migrate(COMPONENT, &patches.to_string())?;
    println!("Verified {} finished patches in {:?}", patches, start.elapsed());

    println!(
        "{} rows, {} recorded statements",
        ctx.count("SELECT COUNT(*) FROM stress")?,
        ctx.count("SELECT COUNT(*) FROM darwin_sql")?
    );

    cleanup(ctx)
}
