use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!(max_connections, "connected to db");

        let db = Self { pool };
        // Default off: the catalog schema is usually owned by the web application.
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on)");
            db.run_migrations().await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(db)
    }

    /// Apply every `NNNN_name.sql` file in `migrations/` not yet recorded in
    /// `_sqlx_migrations`, in numeric order.
    pub async fn run_migrations(&self) -> Result<()> {
        let dir = migrations_dir();
        if !dir.exists() {
            info!(dir = %dir.display(), "no migrations directory; nothing to apply");
            return Ok(());
        }
        // raw_sql keeps this working behind PgBouncer (no prepared statements)
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _sqlx_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(&self.pool)
        .await?;

        let mut applied: HashSet<i64> = HashSet::new();
        for row in sqlx::raw_sql("SELECT version FROM _sqlx_migrations")
            .fetch_all(&self.pool)
            .await?
        {
            applied.insert(row.try_get::<i64, _>(0)?);
        }

        let mut candidates = migration_files(&dir)?;
        candidates.sort_by_key(|(v, _, _)| *v);
        for (version, desc, path) in candidates {
            if !applied.insert(version) {
                continue;
            }
            let sql = std::fs::read_to_string(&path)
                .with_context(|| format!("reading migration {}", path.display()))?;
            info!(version, file = ?path, "applying migration");
            let trimmed = sql.trim();
            if !trimmed.is_empty() {
                sqlx::raw_sql(trimmed).execute(&self.pool).await?;
            }
            let insert_stmt = format!(
                "INSERT INTO _sqlx_migrations(version, description) VALUES ({}, '{}')",
                version,
                desc.replace('\'', "''")
            );
            sqlx::raw_sql(&insert_stmt).execute(&self.pool).await?;
        }
        info!("migrations up-to-date");
        Ok(())
    }
}

fn migrations_dir() -> PathBuf {
    let local = Path::new("./migrations");
    if local.exists() {
        return local.to_path_buf();
    }
    Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")
}

/// Pattern: digits '_' rest '.sql'. Anything else in the directory is ignored.
fn migration_files(dir: &Path) -> Result<Vec<(i64, String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((version, desc)) = parse_migration_name(fname) {
            out.push((version, desc, path));
        }
    }
    Ok(out)
}

fn parse_migration_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let (num, rest) = stem.split_once('_')?;
    if num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((num.parse().ok()?, rest.to_string()))
}
