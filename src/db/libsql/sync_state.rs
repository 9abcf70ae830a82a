//! SyncStateStore implementation for LibSqlBackend.

use async_trait::async_trait;
use chrono::Utc;

use super::{LibSqlBackend, fmt_ts, get_opt_text, map_write_error};
use crate::db::{SyncState, SyncStateStore};
use crate::error::DatabaseError;

#[async_trait]
impl SyncStateStore for LibSqlBackend {
    async fn get_sync_state(&self, account: &str) -> Result<SyncState, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT device_id, next_batch FROM sync_state WHERE account = ?1",
                libsql::params![account],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(SyncState {
                device_id: get_opt_text(&row, 0),
                next_batch: get_opt_text(&row, 1),
            }),
            Ok(None) => Ok(SyncState::default()),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn save_device_id(&self, account: &str, device_id: &str) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO sync_state (account, device_id, next_batch, updated_at)
            VALUES (?1, ?2, NULL, ?3)
            ON CONFLICT (account) DO UPDATE SET
                next_batch = CASE
                    WHEN sync_state.device_id IS excluded.device_id THEN sync_state.next_batch
                    ELSE NULL
                END,
                device_id = excluded.device_id,
                updated_at = excluded.updated_at
            "#,
            libsql::params![account, device_id, fmt_ts(&Utc::now())],
        )
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn save_next_batch(&self, account: &str, next_batch: &str) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO sync_state (account, device_id, next_batch, updated_at)
            VALUES (?1, NULL, ?2, ?3)
            ON CONFLICT (account) DO UPDATE SET
                next_batch = excluded.next_batch,
                updated_at = excluded.updated_at
            "#,
            libsql::params![account, next_batch, fmt_ts(&Utc::now())],
        )
        .await
        .map_err(map_write_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::db::libsql::tests::temp_backend;
    use crate::db::{SyncState, SyncStateStore};

    #[tokio::test]
    async fn unknown_account_starts_empty() {
        let (_dir, db) = temp_backend().await;
        assert_eq!(
            db.get_sync_state("botbot").await.unwrap(),
            SyncState::default()
        );
    }

    #[tokio::test]
    async fn token_survives_same_device_login() {
        let (_dir, db) = temp_backend().await;
        db.save_device_id("botbot", "AGENTDEV").await.unwrap();
        db.save_next_batch("botbot", "s72594_4483").await.unwrap();
        db.save_device_id("botbot", "AGENTDEV").await.unwrap();

        assert_eq!(
            db.get_sync_state("botbot").await.unwrap(),
            SyncState {
                device_id: Some("AGENTDEV".to_string()),
                next_batch: Some("s72594_4483".to_string()),
            }
        );
        assert_eq!(
            db.get_sync_state("other").await.unwrap(),
            SyncState::default()
        );
    }

    #[tokio::test]
    async fn new_device_forgets_token() {
        let (_dir, db) = temp_backend().await;
        db.save_device_id("botbot", "AGENTDEV").await.unwrap();
        db.save_next_batch("botbot", "s1").await.unwrap();
        db.save_device_id("botbot", "NEWDEV").await.unwrap();

        let state = db.get_sync_state("botbot").await.unwrap();
        assert_eq!(state.device_id.as_deref(), Some("NEWDEV"));
        assert_eq!(state.next_batch, None);
    }
}
