//! BotStore implementation for LibSqlBackend.

use async_trait::async_trait;

use super::{
    LibSqlBackend, fmt_ts, get_i64, get_opt_text, get_text, get_ts, map_write_error, opt_text,
};
use crate::db::{BotRecord, BotStore};
use crate::error::DatabaseError;
use crate::matrix::UserId;

const BOT_COLUMNS: &str = "mxid, owner_mxid, credential, created_at";

fn row_to_bot(row: &libsql::Row) -> Result<BotRecord, DatabaseError> {
    let mxid = UserId::parse(get_text(row, 0)).map_err(|e| DatabaseError::Query(e.to_string()))?;
    let owner =
        UserId::parse(get_text(row, 1)).map_err(|e| DatabaseError::Query(e.to_string()))?;
    Ok(BotRecord {
        mxid,
        owner,
        credential: get_opt_text(row, 2),
        created_at: get_ts(row, 3),
    })
}

#[async_trait]
impl BotStore for LibSqlBackend {
    async fn get_bot(&self, mxid: &UserId) -> Result<Option<BotRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM bots WHERE mxid = ?1", BOT_COLUMNS),
                libsql::params![mxid.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_bot(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn list_bots_by_owner(&self, owner: &UserId) -> Result<Vec<BotRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM bots WHERE owner_mxid = ?1 ORDER BY mxid",
                    BOT_COLUMNS
                ),
                libsql::params![owner.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let mut bots = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => bots.push(row_to_bot(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(e.to_string())),
            }
        }
        Ok(bots)
    }

    async fn count_bots_by_owner(&self, owner: &UserId) -> Result<usize, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM bots WHERE owner_mxid = ?1",
                libsql::params![owner.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(get_i64(&row, 0).max(0) as usize),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn insert_bot(&self, record: &BotRecord) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO bots (mxid, owner_mxid, credential, created_at) VALUES (?1, ?2, ?3, ?4)",
            libsql::params![
                record.mxid.as_str(),
                record.owner.as_str(),
                opt_text(record.credential.as_deref()),
                fmt_ts(&record.created_at),
            ],
        )
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn set_bot_credential(
        &self,
        mxid: &UserId,
        credential: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "UPDATE bots SET credential = ?2 WHERE mxid = ?1",
            libsql::params![mxid.as_str(), opt_text(credential)],
        )
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn delete_bot(&self, mxid: &UserId) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "DELETE FROM bots WHERE mxid = ?1",
            libsql::params![mxid.as_str()],
        )
        .await
        .map_err(map_write_error)?;
        Ok(())
    }
}
