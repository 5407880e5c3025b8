//! Backup restore adapter.
//!
//! Takes an uploaded `.bak` file, lands it in the directory shared with the
//! database server, reads the backup's file manifest for its logical data and
//! log file names, and issues a `RESTORE DATABASE ... WITH MOVE` into a
//! freshly named database.
//!
//! The restore statements interpolate paths and the generated database name
//! directly into T-SQL: the server cannot parameterize `FROM DISK` literals
//! or DDL identifiers. Every interpolated fragment is either system-generated
//! or passed through an allow-list sanitizer first.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::mssql;

/// Result of a successful restore.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    /// Name of the newly created database.
    pub database: String,
    /// The stored backup file name (unique-id prefix included).
    pub stored_file: String,
}

/// Restore from a backup file on disk (CLI path).
pub async fn restore_backup_file(config: &Config, path: &Path) -> Result<RestoreOutcome> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid backup file path: {}", path.display()))?;
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read backup file: {}", path.display()))?;
    restore_backup_bytes(config, filename, &bytes).await
}

/// Restore from uploaded backup bytes.
///
/// Single attempt, no retry: a failed restore leaves no database recorded
/// and the caller's session state untouched.
pub async fn restore_backup_bytes(
    config: &Config,
    filename: &str,
    bytes: &[u8],
) -> Result<RestoreOutcome> {
    if !filename.to_lowercase().ends_with(".bak") {
        bail!("Unsupported file type. Please upload a .bak (SQL Server backup).");
    }

    let unique_id = short_id();
    let stored_file = format!("{}_{}", unique_id, sanitize_filename(filename));
    let database = format!("userdb_{}", unique_id);
    debug_assert!(is_safe_identifier(&database));

    // Land the file where the app sees the shared volume.
    std::fs::create_dir_all(&config.backup.backup_dir)?;
    let app_path = config.backup.backup_dir.join(&stored_file);
    std::fs::write(&app_path, bytes)
        .with_context(|| format!("Failed to write backup to {}", app_path.display()))?;

    // The same file, as the database server sees it.
    let server_path = config.backup.server_backup_dir.join(&stored_file);

    tracing::info!(file = %stored_file, database = %database, "restoring backup");
    run_restore(config, &server_path, &database).await?;

    Ok(RestoreOutcome {
        database,
        stored_file,
    })
}

async fn run_restore(config: &Config, server_path: &Path, database: &str) -> Result<()> {
    let mut client = mssql::connect(&config.mssql, "master").await?;

    let disk = escape_literal(&server_path.display().to_string());

    // Discover the logical file names inside the backup.
    let manifest = mssql::run_query(
        &mut client,
        &format!("RESTORE FILELISTONLY FROM DISK = N'{}'", disk),
    )
    .await
    .context("RESTORE FILELISTONLY failed")?;

    if manifest.rows.len() < 2 {
        bail!("Unexpected FILELISTONLY result; expected at least data and log files.");
    }

    let logical_idx = manifest
        .columns
        .iter()
        .position(|c| c == "LogicalName")
        .ok_or_else(|| anyhow::anyhow!("FILELISTONLY result has no LogicalName column"))?;

    let logical_name = |row: &[serde_json::Value]| -> Result<String> {
        row.get(logical_idx)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("FILELISTONLY row has no logical name"))
    };
    let logical_data = logical_name(&manifest.rows[0])?;
    let logical_log = logical_name(&manifest.rows[1])?;

    let data_path = config
        .backup
        .server_data_dir
        .join(format!("{}_Data.mdf", database));
    let log_path = config
        .backup
        .server_data_dir
        .join(format!("{}_Log.ldf", database));

    let restore_sql = format!(
        "RESTORE DATABASE [{}] \
         FROM DISK = N'{}' \
         WITH REPLACE, \
         MOVE N'{}' TO N'{}', \
         MOVE N'{}' TO N'{}'",
        database,
        disk,
        escape_literal(&logical_data),
        escape_literal(&data_path.display().to_string()),
        escape_literal(&logical_log),
        escape_literal(&log_path.display().to_string()),
    );

    mssql::run_query(&mut client, &restore_sql)
        .await
        .context("RESTORE DATABASE failed")?;

    Ok(())
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Reduce a user-supplied filename to an allow-listed character set.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Generated database identifiers must stay within `[A-Za-z0-9_]`.
fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double single quotes for use inside an `N'...'` literal.
fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}
