use sqlx::SqlitePool;

/// Key of the alert sound toggle.
pub const SOUND_ENABLED: &str = "sound_enabled";

/// Read a boolean setting. Missing keys yield `None`.
pub async fn get_flag(pool: &SqlitePool, key: &str) -> Result<Option<bool>, sqlx::Error> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM preferences WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value.map(|v| v == "true"))
}

/// Upsert a boolean setting.
pub async fn set_flag(pool: &SqlitePool, key: &str, value: bool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO preferences (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
    )
    .bind(key)
    .bind(if value { "true" } else { "false" })
    .execute(pool)
    .await?;
    Ok(())
}
