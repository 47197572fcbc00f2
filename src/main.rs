//! Typewriter CLI - inspect dialect type tables, capabilities and SQLite stores

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use typewriter::backend;
use typewriter::config;
use typewriter::{Dialect, ScalarKind, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "typewriter")]
#[command(version = "0.0.1")]
#[command(about = "Type-safe persistence layer - one query/update API over SQL dialects and document stores")]
#[command(long_about = r#"
Typewriter compiles typed constraints into engine-native queries for
H2, SQLite, MariaDB, PostgreSQL, DuckDB and MongoDB-style stores.

Example usage:
  typewriter types --dialect postgres
  typewriter capabilities
  typewriter inspect --url sqlite:app.db
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the native type for every scalar kind
    Types {
        /// Only this dialect (h2, sqlite, mariadb, postgres, duckdb, mongodb)
        #[arg(short, long)]
        dialect: Option<String>,
    },

    /// Print which optional features each dialect supports
    Capabilities {
        /// Only this dialect
        #[arg(short, long)]
        dialect: Option<String>,
    },

    /// List the tables of a SQLite database with their row counts
    Inspect {
        /// Connection URL, e.g. sqlite:app.db
        #[arg(short, long)]
        url: String,
    },

    /// Print the effective configuration
    Config {
        /// Path to the configuration file
        #[arg(short, long, default_value = "typewriter.toml")]
        path: PathBuf,
    },
}

fn selected(dialect: Option<String>) -> anyhow::Result<Vec<Dialect>> {
    Ok(match dialect {
        Some(name) => vec![name.parse::<Dialect>()?],
        None => Dialect::all().to_vec(),
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Types { dialect } => {
            for dialect in selected(dialect)? {
                println!("{}:", dialect);
                for kind in ScalarKind::all() {
                    let native = dialect.native_type(*kind).unwrap_or("-");
                    println!("  {:<10} {}", kind.as_str(), native);
                }
            }
        }

        Commands::Capabilities { dialect } => {
            for dialect in selected(dialect)? {
                println!("{}:", dialect);
                for (feature, supported) in dialect.capabilities() {
                    println!("  {} {}", if supported { "✅" } else { "❌" }, feature);
                }
            }
        }

        Commands::Inspect { url } => {
            let dialect = Dialect::from_url(&url)?;
            if dialect != Dialect::Sqlite {
                anyhow::bail!("inspect reads SQLite databases only, got {} URL [{}]", dialect, url);
            }
            let handle = backend::acquire(dialect, &url)?;

            println!("🗄️  Database: {}", handle.url());
            let tables = handle.query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            if tables.is_empty() {
                println!("❌ No tables found.");
            }
            for row in tables {
                let Some(Value::Text(table)) = row.into_iter().next() else {
                    continue;
                };
                let count = handle
                    .query(&format!("SELECT COUNT(*) FROM {}", dialect.table(&table)))?
                    .first()
                    .and_then(|row| row.first())
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                println!("  {:<24} {} rows", table, count);
            }
            backend::release(&url)?;
        }

        Commands::Config { path } => {
            let config = config::load_config(Some(&path))?
                .unwrap_or_default()
                .apply_env();
            println!("{}", toml::to_string_pretty(&config)?);
            if !path.exists() {
                tracing::info!("{} not found; showing defaults", path.display());
            }
        }
    }

    Ok(())
}
