//! Settings table access
//!
//! Read/write runtime settings from the `settings` key/value table.

use crate::Result;
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tracing::{info, warn};

/// Read a setting, parsing it into `T`
///
/// Returns `None` when the key is missing, NULL, or does not parse.
pub async fn get_setting<T: FromStr>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(db)
            .await?;

    match value.flatten() {
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(_) => {
                warn!("Setting '{}' has unparseable value '{}'", key, raw);
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

/// Insert or replace a setting
pub async fn set_setting<T: ToString>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;

    Ok(())
}

/// Write `default_value` if the key is missing or NULL; leave existing values alone
pub async fn ensure_setting(db: &Pool<Sqlite>, key: &str, default_value: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        WHERE settings.value IS NULL
        "#,
    )
    .bind(key)
    .bind(default_value)
    .execute(db)
    .await?;

    if result.rows_affected() > 0 {
        info!("Initialized setting '{}' with default value: {}", key, default_value);
    }
    Ok(())
}

/// Read a setting, writing `default` back when it is missing or invalid
pub async fn get_or_init_setting<T>(db: &Pool<Sqlite>, key: &str, default: T) -> Result<T>
where
    T: FromStr + ToString,
{
    match get_setting::<T>(db, key).await? {
        Some(v) => Ok(v),
        None => {
            set_setting(db, key, default.to_string()).await?;
            Ok(default)
        }
    }
}
