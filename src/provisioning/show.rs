//! `show <username>`: account metadata for one of the operator's bots.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::admin::DeviceInfo;
use crate::error::WorkflowError;
use crate::matrix::UserId;
use crate::provisioning::{Outcome, Provisioner};

const UNIX_DATE: &str = "%a %b %e %H:%M:%S UTC %Y";

impl Provisioner {
    pub async fn show(&self, operator: &UserId, args: &[String]) -> Result<Outcome, WorkflowError> {
        let Some(username) = args.first() else {
            return Err(WorkflowError::Usage("show <username>"));
        };
        let bot = self.resolve_owned_bot(operator, username).await?;

        let info = self
            .admin
            .account_info(&bot.mxid)
            .await
            .map_err(|e| WorkflowError::admin("get bot user info", e))?;
        let devices = self
            .admin
            .list_devices(&bot.mxid)
            .await
            .map_err(|e| WorkflowError::admin("get bot device info", e))?;

        let (device_id, last_seen) = match devices.first() {
            Some(device) => {
                if devices.len() > 1 {
                    tracing::warn!(
                        bot = %bot.mxid,
                        devices = devices.len(),
                        "Bot has multiple devices"
                    );
                }
                (device.device_id.clone(), describe_last_seen(device, Utc::now()))
            }
            None => {
                tracing::warn!(bot = %bot.mxid, "Bot has no devices");
                ("<none>".to_string(), "N/A".to_string())
            }
        };

        Ok(Outcome::Reply(format!(
            "Bot `{}` info:\n\n* Created on {}\n* Device ID: `{}`\n* Last seen {}\n",
            info.user_id,
            info.created_at.format(UNIX_DATE),
            device_id,
            last_seen
        )))
    }
}

fn describe_last_seen(device: &DeviceInfo, now: DateTime<Utc>) -> String {
    format_last_seen(device.last_seen, device.last_seen_ip.as_deref(), now)
}

/// "never", "now", "<duration> ago", or an absolute date once a week has
/// passed, followed by the origin address when known.
pub fn format_last_seen(
    last_seen: Option<DateTime<Utc>>,
    ip: Option<&str>,
    now: DateTime<Utc>,
) -> String {
    let mut text = match last_seen {
        None => "never".to_string(),
        Some(seen) => {
            let ago = (now - seen).to_std().unwrap_or(Duration::ZERO);
            if ago < Duration::from_secs(1) {
                "now".to_string()
            } else if ago >= Duration::from_secs(7 * 24 * 60 * 60) {
                format!("at {}", seen.format(UNIX_DATE))
            } else {
                format!("{} ago", format_duration(ago))
            }
        }
    };
    if let Some(ip) = ip.filter(|ip| !ip.is_empty()) {
        text.push_str(" from ");
        text.push_str(ip);
    }
    text
}

/// Human-readable duration with second precision, e.g. "1 hour and 5 minutes".
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let units = [
        (total / 86_400, "day"),
        (total % 86_400 / 3_600, "hour"),
        (total % 3_600 / 60, "minute"),
        (total % 60, "second"),
    ];
    let parts: Vec<String> = units
        .iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| {
            if *value == 1 {
                format!("1 {}", unit)
            } else {
                format!("{} {}s", value, unit)
            }
        })
        .collect();

    match parts.split_last() {
        None => "0 seconds".to_string(),
        Some((last, [])) => last.clone(),
        Some((last, rest)) => format!("{} and {}", rest.join(", "), last),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn durations_read_naturally() {
        assert_eq!(format_duration(Duration::from_secs(300)), "5 minutes");
        assert_eq!(format_duration(Duration::from_secs(1)), "1 second");
        assert_eq!(
            format_duration(Duration::from_secs(3_600 + 5 * 60 + 2)),
            "1 hour, 5 minutes and 2 seconds"
        );
        assert_eq!(format_duration(Duration::from_secs(2 * 86_400)), "2 days");
        assert_eq!(format_duration(Duration::ZERO), "0 seconds");
    }

    #[test]
    fn last_seen_rules() {
        assert_eq!(format_last_seen(None, None, now()), "never");
        assert_eq!(format_last_seen(Some(now()), None, now()), "now");
        assert_eq!(
            format_last_seen(
                Some(now() - chrono::Duration::minutes(90)),
                Some("10.0.0.7"),
                now()
            ),
            "1 hour and 30 minutes ago from 10.0.0.7"
        );
        assert_eq!(
            format_last_seen(Some(now() - chrono::Duration::days(8)), Some(""), now()),
            "at Thu Mar  7 12:00:00 UTC 2024"
        );
    }
}

#[cfg(all(test, feature = "libsql"))]
mod workflow_tests {
    use crate::admin::DeviceInfo;
    use crate::error::WorkflowError;
    use crate::provisioning::Outcome;
    use crate::provisioning::test_support::{alice, bob, harness, words};

    #[tokio::test]
    async fn shows_first_device() {
        let h = harness().await;
        h.provisioner
            .create(&alice(), &words("coolbot"))
            .await
            .unwrap();
        h.admin.set_devices(
            "coolbot",
            vec![DeviceInfo {
                device_id: "ABCDEF".to_string(),
                display_name: None,
                last_seen: None,
                last_seen_ip: None,
            }],
        );

        let Outcome::Reply(body) = h.provisioner.show(&alice(), &words("CoolBot")).await.unwrap()
        else {
            panic!("expected a plain reply");
        };
        assert!(body.starts_with("Bot `@coolbot:example.com` info:"));
        assert!(body.contains("* Device ID: `ABCDEF`"));
        assert!(body.contains("* Last seen never"));
    }

    #[tokio::test]
    async fn no_devices_and_foreign_bots() {
        let h = harness().await;
        h.provisioner
            .create(&alice(), &words("coolbot"))
            .await
            .unwrap();

        let Outcome::Reply(body) = h.provisioner.show(&alice(), &words("coolbot")).await.unwrap()
        else {
            panic!("expected a plain reply");
        };
        assert!(body.contains("* Device ID: `<none>`"));
        assert!(body.contains("* Last seen N/A"));

        assert!(matches!(
            h.provisioner.show(&bob(), &words("coolbot")).await,
            Err(WorkflowError::NotOwned(_))
        ));
        assert!(matches!(
            h.provisioner.show(&alice(), &words("ghostbot")).await,
            Err(WorkflowError::NotFound(_))
        ));
    }
}
