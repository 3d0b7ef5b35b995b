//! Configuration handling for chryso.
//!
//! This module provides configuration management via CLI arguments and environment variables.

use crate::error::{DbError, DbResult};
use clap::Parser;

pub const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Database connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Full connection URL (may point at a file; not logged).
    pub connection_string: String,
    /// Create the database file on first connect. Default: true
    pub create_if_missing: bool,
}

impl DatabaseConfig {
    /// Parse a database config from a connection URL.
    ///
    /// # Format
    ///
    /// - `sqlite::memory:` - private in-memory database per connection
    /// - `sqlite:path/to/db.sqlite` - file database, created if missing
    /// - `sqlite:path/to/db.sqlite?create=false` - file database that must exist
    ///
    /// Any other query parameters are passed through to the driver.
    pub fn parse(s: &str) -> DbResult<Self> {
        let s = s.trim();
        let Some(rest) = s.strip_prefix("sqlite:") else {
            return Err(DbError::invalid_input(format!(
                "Unsupported database URL '{}': only sqlite: URLs are supported",
                s
            )));
        };
        if rest.trim_start_matches("//").is_empty() {
            return Err(DbError::invalid_input(
                "SQLite requires a database file path or :memory:",
            ));
        }

        let (base, query) = match s.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (s, None),
        };

        let mut create_if_missing = true;
        let mut remaining = Vec::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            match pair.split_once('=') {
                Some((key, value)) if key.eq_ignore_ascii_case("create") => {
                    create_if_missing = !value.eq_ignore_ascii_case("false");
                }
                _ if pair.is_empty() => {}
                _ => remaining.push(pair),
            }
        }

        let connection_string = if remaining.is_empty() {
            base.to_string()
        } else {
            format!("{}?{}", base, remaining.join("&"))
        };

        Ok(Self {
            connection_string,
            create_if_missing,
        })
    }

    pub fn is_memory(&self) -> bool {
        self.connection_string.contains(":memory:")
            || self.connection_string.contains("mode=memory")
    }
}

/// Configuration for the chryso CLI.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "chryso",
    about = "Run SQL statements inside one nested-transaction-aware atomic block",
    version,
    author
)]
pub struct Config {
    /// Database connection URL, e.g. "sqlite:app.db".
    /// Add ?create=false to require an existing file.
    #[arg(
        short = 'd',
        long = "database",
        value_name = "URL",
        env = "CHRYSO_DATABASE",
        default_value = DEFAULT_DATABASE_URL
    )]
    pub database: String,

    /// Statements to execute, in order.
    #[arg(value_name = "SQL")]
    pub statements: Vec<String>,

    /// Run every statement in its own top-level transaction instead of one
    /// shared transaction.
    #[arg(long)]
    pub per_statement: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "CHRYSO_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "CHRYSO_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            database: DEFAULT_DATABASE_URL.to_string(),
            statements: Vec::new(),
            per_statement: false,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            json_logs: false,
        }
    }

    /// Parse the database configuration.
    pub fn database_config(&self) -> DbResult<DatabaseConfig> {
        DatabaseConfig::parse(&self.database)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
