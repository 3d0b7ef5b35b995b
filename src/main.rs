//! chryso - Main entry point.
//!
//! Runs the given SQL statements inside an atomic block and prints each
//! result set as a JSON line. Any failure rolls the block back.

use chryso::config::Config;
use chryso::{DbError, Engine, RowSet};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print_rows(rows: &RowSet) -> Result<(), DbError> {
    let line = serde_json::to_string(rows)
        .map_err(|e| DbError::invalid_input(format!("Failed to encode result: {}", e)))?;
    println!("{}", line);
    Ok(())
}

fn run(engine: &Engine, config: &Config) -> Result<(), DbError> {
    if config.per_statement {
        for sql in &config.statements {
            let rows = engine.atomic(|tx| tx.execute(sql, &[]))?;
            print_rows(&rows)?;
        }
        return Ok(());
    }

    engine.atomic(|tx| {
        for sql in &config.statements {
            let rows = tx.execute(sql, &[])?;
            print_rows(&rows)?;
        }
        Ok(())
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    if config.statements.is_empty() {
        eprintln!("Error: no SQL statements given.");
        eprintln!();
        eprintln!("Usage: chryso [--database <url>] [--per-statement] <SQL>...");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  chryso --database sqlite:app.db \"CREATE TABLE t (x INTEGER)\"");
        eprintln!("  chryso -d sqlite:app.db \"INSERT INTO t VALUES (1)\" \"SELECT * FROM t\"");
        std::process::exit(1);
    }

    info!(
        statements = config.statements.len(),
        per_statement = config.per_statement,
        "Starting chryso v{}",
        env!("CARGO_PKG_VERSION")
    );

    let engine = Engine::connect(&config.database_config()?)?;
    let result = run(&engine, &config);
    engine.dispose();

    if let Err(e) = result {
        error!(error = %e, "Block rolled back");
        return Err(e.into());
    }

    Ok(())
}
