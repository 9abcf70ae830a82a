//! `botkeeper reconcile`: inspect and resolve the provisioning journal.

use std::sync::Arc;

use crate::admin::AdminApi;
use crate::config::Config;
use crate::db::{self, JournalEntry};
use crate::provisioning::{ReconcileReport, reconcile};

pub async fn run_reconcile_command(deactivate: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let db = db::connect_from_config(&config.database).await?;

    let session = super::login_service_account(&config, db.as_ref()).await?;
    let admin: Arc<dyn AdminApi> = Arc::new(super::admin_client(&config, &session)?);

    let report = reconcile(db.as_ref(), admin.as_ref(), deactivate).await?;
    print!("{}", render_report(&report, deactivate));

    if !report.failed.is_empty() {
        anyhow::bail!("{} journal entr(y/ies) could not be resolved", report.failed.len());
    }
    Ok(())
}

fn render_entry(entry: &JournalEntry) -> String {
    let mut line = format!(
        "  {} ({}) owner {} updated {}",
        entry.mxid,
        entry.state,
        entry.owner,
        entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(detail) = &entry.detail {
        line.push_str(&format!("\n      {detail}"));
    }
    line
}

fn render_report(report: &ReconcileReport, deactivate: bool) -> String {
    if report.entries.is_empty() {
        return "No unfinished provisioning journal entries.\n".to_string();
    }

    let mut out = format!("{} unfinished journal entr(y/ies):\n", report.entries.len());
    for entry in &report.entries {
        out.push_str(&render_entry(entry));
        out.push('\n');
    }

    if !deactivate {
        out.push_str("\nRun `botkeeper reconcile --deactivate` to resolve them.\n");
        return out;
    }

    out.push_str(&format!(
        "\n  {} resolved, {} failed\n",
        report.resolved.len(),
        report.failed.len()
    ));
    for (mxid, reason) in &report.failed {
        out.push_str(&format!("  [FAIL] {mxid}: {reason}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::JournalState;
    use crate::matrix::UserId;

    fn entry(localpart: &str, state: JournalState) -> JournalEntry {
        JournalEntry::new(
            UserId::new(localpart, "example.com"),
            UserId::new("alice", "example.com"),
            state,
        )
    }

    #[test]
    fn empty_journal() {
        let report = ReconcileReport::default();
        assert_eq!(
            render_report(&report, false),
            "No unfinished provisioning journal entries.\n"
        );
    }

    #[test]
    fn listing_suggests_deactivate() {
        let report = ReconcileReport {
            entries: vec![
                entry("lostbot", JournalState::Orphaned).with_detail("deactivation failed"),
            ],
            ..ReconcileReport::default()
        };
        let text = render_report(&report, false);
        assert!(text.starts_with(
            "1 unfinished journal entr(y/ies):\n  @lostbot:example.com (orphaned) owner @alice:example.com"
        ));
        assert!(text.contains("      deactivation failed\n"));
        assert!(text.ends_with("--deactivate` to resolve them.\n"));
    }

    #[test]
    fn resolution_summary_lists_failures() {
        let report = ReconcileReport {
            entries: vec![
                entry("lostbot", JournalState::Orphaned),
                entry("halfbot", JournalState::Pending),
            ],
            resolved: vec![UserId::new("halfbot", "example.com")],
            failed: vec![(UserId::new("lostbot", "example.com"), "HTTP 500".to_string())],
        };
        let text = render_report(&report, true);
        assert!(text.contains("  1 resolved, 1 failed\n"));
        assert!(text.contains("  [FAIL] @lostbot:example.com: HTTP 500\n"));
    }
}
