//! Resolution of provisioning journal entries left behind by interrupted or
//! partially failed `create`/`delete` runs.

use crate::admin::AdminApi;
use crate::db::{Database, JournalEntry, JournalState};
use crate::error::DatabaseError;
use crate::matrix::UserId;

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Every unfinished entry found.
    pub entries: Vec<JournalEntry>,
    /// Entries cleared by this run.
    pub resolved: Vec<UserId>,
    pub failed: Vec<(UserId, String)>,
}

enum Resolution {
    /// Nothing exists upstream, or the bot record is in place.
    Clear,
    /// Deactivate upstream, drop any bot record, then clear.
    Deactivate,
}

/// List unfinished journal entries; with `deactivate`, resolve them.
pub async fn reconcile(
    db: &dyn Database,
    admin: &dyn AdminApi,
    deactivate: bool,
) -> Result<ReconcileReport, DatabaseError> {
    let mut report = ReconcileReport {
        entries: db.list_journal().await?,
        ..ReconcileReport::default()
    };
    if !deactivate {
        return Ok(report);
    }

    for entry in &report.entries {
        let resolution = match decide(db, admin, entry).await {
            Ok(resolution) => resolution,
            Err(reason) => {
                report.failed.push((entry.mxid.clone(), reason));
                continue;
            }
        };

        if let Resolution::Deactivate = resolution {
            if let Err(e) = admin.deactivate_user(&entry.mxid).await {
                tracing::error!(bot = %entry.mxid, "Failed to deactivate orphaned bot: {}", e);
                report.failed.push((entry.mxid.clone(), e.to_string()));
                continue;
            }
            db.delete_bot(&entry.mxid).await?;
            tracing::info!(bot = %entry.mxid, state = %entry.state, "Deactivated orphaned bot");
        }

        db.clear_journal(&entry.mxid).await?;
        report.resolved.push(entry.mxid.clone());
    }
    Ok(report)
}

async fn decide(
    db: &dyn Database,
    admin: &dyn AdminApi,
    entry: &JournalEntry,
) -> Result<Resolution, String> {
    if entry.state == JournalState::Orphaned {
        return Ok(Resolution::Deactivate);
    }

    let has_record = db
        .get_bot(&entry.mxid)
        .await
        .map_err(|e| e.to_string())?
        .is_some();
    if has_record {
        return Ok(Resolution::Clear);
    }

    if entry.state == JournalState::Pending {
        let available = admin
            .is_username_available(entry.mxid.localpart())
            .await
            .map_err(|e| e.to_string())?;
        if available {
            return Ok(Resolution::Clear);
        }
    }
    Ok(Resolution::Deactivate)
}

#[cfg(all(test, feature = "libsql"))]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::libsql::tests::temp_backend;
    use crate::db::{BotRecord, BotStore, ProvisioningJournal};
    use crate::testing::{AdminStep, FakeAdmin};

    fn alice() -> UserId {
        UserId::new("alice", "example.com")
    }

    fn bot(localpart: &str) -> UserId {
        UserId::new(localpart, "example.com")
    }

    #[tokio::test]
    async fn listing_does_not_touch_anything() {
        let (_dir, db) = temp_backend().await;
        let admin = FakeAdmin::new();
        let lost = JournalEntry::new(bot("lostbot"), alice(), JournalState::Orphaned);
        db.record_journal(&lost).await.unwrap();

        let report = reconcile(&db, &admin, false).await.unwrap();
        assert_eq!(report.entries.len(), 1);
        assert!(report.resolved.is_empty());
        assert!(admin.deactivated().is_empty());
        assert_eq!(db.list_journal().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolves_each_state() {
        let (_dir, db) = temp_backend().await;
        let admin = FakeAdmin::new();

        let lost = JournalEntry::new(bot("lostbot"), alice(), JournalState::Orphaned);
        db.record_journal(&lost).await.unwrap();
        admin.add_account("lostbot");

        let done = JournalEntry::new(bot("donebot"), alice(), JournalState::Registered);
        db.record_journal(&done).await.unwrap();
        db.insert_bot(&BotRecord::new(bot("donebot"), alice()))
            .await
            .unwrap();

        let never = JournalEntry::new(bot("neverbot"), alice(), JournalState::Pending);
        db.record_journal(&never).await.unwrap();

        let half = JournalEntry::new(bot("halfbot"), alice(), JournalState::Pending);
        db.record_journal(&half).await.unwrap();
        admin.add_account("halfbot");

        let mut report = reconcile(&db, &admin, true).await.unwrap();
        report.resolved.sort();
        assert_eq!(
            report.resolved,
            vec![bot("donebot"), bot("halfbot"), bot("lostbot"), bot("neverbot")]
        );
        let mut deactivated = admin.deactivated();
        deactivated.sort();
        assert_eq!(deactivated, vec!["halfbot".to_string(), "lostbot".to_string()]);
        assert!(db.get_bot(&bot("donebot")).await.unwrap().is_some());
        assert!(db.list_journal().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_deactivation_keeps_entry() {
        let (_dir, db) = temp_backend().await;
        let admin = FakeAdmin::new();
        admin.fail(AdminStep::Deactivate);
        let lost = JournalEntry::new(bot("lostbot"), alice(), JournalState::Orphaned);
        db.record_journal(&lost).await.unwrap();

        let report = reconcile(&db, &admin, true).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(db.list_journal().await.unwrap().len(), 1);
    }
}
