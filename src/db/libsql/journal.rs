//! ProvisioningJournal implementation for LibSqlBackend.

use async_trait::async_trait;

use super::{LibSqlBackend, fmt_ts, get_opt_text, get_text, get_ts, map_write_error, opt_text};
use crate::db::{JournalEntry, JournalState, ProvisioningJournal};
use crate::error::DatabaseError;
use crate::matrix::UserId;

fn row_to_entry(row: &libsql::Row) -> Result<JournalEntry, DatabaseError> {
    let mxid = UserId::parse(get_text(row, 0)).map_err(|e| DatabaseError::Query(e.to_string()))?;
    let owner =
        UserId::parse(get_text(row, 1)).map_err(|e| DatabaseError::Query(e.to_string()))?;
    let state_raw = get_text(row, 2);
    let state = JournalState::parse(&state_raw)
        .ok_or_else(|| DatabaseError::Query(format!("unknown journal state: {}", state_raw)))?;
    Ok(JournalEntry {
        mxid,
        owner,
        state,
        detail: get_opt_text(row, 3),
        updated_at: get_ts(row, 4),
    })
}

#[async_trait]
impl ProvisioningJournal for LibSqlBackend {
    async fn record_journal(&self, entry: &JournalEntry) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO provisioning_journal (mxid, owner_mxid, state, detail, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (mxid) DO UPDATE SET
                owner_mxid = excluded.owner_mxid,
                state = excluded.state,
                detail = excluded.detail,
                updated_at = excluded.updated_at
            "#,
            libsql::params![
                entry.mxid.as_str(),
                entry.owner.as_str(),
                entry.state.as_str(),
                opt_text(entry.detail.as_deref()),
                fmt_ts(&entry.updated_at),
            ],
        )
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn clear_journal(&self, mxid: &UserId) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "DELETE FROM provisioning_journal WHERE mxid = ?1",
            libsql::params![mxid.as_str()],
        )
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn list_journal(&self) -> Result<Vec<JournalEntry>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT mxid, owner_mxid, state, detail, updated_at \
                 FROM provisioning_journal ORDER BY updated_at",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let mut entries = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => entries.push(row_to_entry(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(e.to_string())),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::libsql::tests::temp_backend;
    use crate::db::{JournalEntry, JournalState, ProvisioningJournal};
    use crate::matrix::UserId;

    #[tokio::test]
    async fn journal_entry_moves_through_states() {
        let (_dir, db) = temp_backend().await;
        let bot = UserId::new("coolbot", "example.com");
        let owner = UserId::new("alice", "example.com");

        let pending = JournalEntry::new(bot.clone(), owner.clone(), JournalState::Pending);
        db.record_journal(&pending).await.unwrap();
        db.record_journal(
            &JournalEntry::new(bot.clone(), owner, JournalState::Orphaned)
                .with_detail("deactivation failed"),
        )
        .await
        .unwrap();

        let entries = db.list_journal().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, JournalState::Orphaned);
        assert_eq!(entries[0].detail.as_deref(), Some("deactivation failed"));

        db.clear_journal(&bot).await.unwrap();
        assert!(db.list_journal().await.unwrap().is_empty());
    }
}
