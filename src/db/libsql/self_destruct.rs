//! SelfDestructStore implementation for LibSqlBackend.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use super::{LibSqlBackend, get_i64, get_text, map_write_error};
use crate::db::{SelfDestructRecord, SelfDestructStore};
use crate::error::DatabaseError;
use crate::matrix::{EventId, RoomId};

fn row_to_record(row: &libsql::Row) -> Result<SelfDestructRecord, DatabaseError> {
    let event_id =
        EventId::parse(get_text(row, 0)).map_err(|e| DatabaseError::Query(e.to_string()))?;
    let room_id =
        RoomId::parse(get_text(row, 1)).map_err(|e| DatabaseError::Query(e.to_string()))?;
    let delete_at_ms = get_i64(row, 2);
    let delete_at = Utc
        .timestamp_millis_opt(delete_at_ms)
        .single()
        .ok_or_else(|| DatabaseError::Query(format!("invalid delete_at: {}", delete_at_ms)))?;
    Ok(SelfDestructRecord {
        event_id,
        room_id,
        delete_at,
    })
}

#[async_trait]
impl SelfDestructStore for LibSqlBackend {
    async fn insert_self_destruct(&self, record: &SelfDestructRecord) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO self_destructing_events (event_id, room_id, delete_at) VALUES (?1, ?2, ?3)",
            libsql::params![
                record.event_id.as_str(),
                record.room_id.as_str(),
                record.delete_at.timestamp_millis(),
            ],
        )
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn delete_self_destruct(&self, event_id: &EventId) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "DELETE FROM self_destructing_events WHERE event_id = ?1",
            libsql::params![event_id.as_str()],
        )
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn list_self_destructs(&self) -> Result<Vec<SelfDestructRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT event_id, room_id, delete_at FROM self_destructing_events ORDER BY delete_at",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let mut records = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => records.push(row_to_record(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(e.to_string())),
            }
        }
        Ok(records)
    }
}
