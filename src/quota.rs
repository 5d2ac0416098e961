// ABOUTME: Burst/daily/monthly quota evaluation per client and per number
// ABOUTME: Counters increment only on successful delivery; denial is a first-class outcome, not an error

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use thiserror::Error;

use crate::domain::{Client, Direction, Number};
use crate::envelope::MessageKind;
use crate::repository::UsageRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Burst,
    Daily,
    Monthly,
}

impl WindowKind {
    fn label(&self) -> &'static str {
        match self {
            WindowKind::Burst => "burst",
            WindowKind::Daily => "daily",
            WindowKind::Monthly => "monthly",
        }
    }
}

/// Duration of the burst window.
pub const BURST_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("{kind} limit exceeded: used {used} of {limit} in the {period} window")]
    LimitExceeded {
        kind: &'static str,
        limit: u32,
        used: u32,
        period: &'static str,
    },
}

/// One `(kind, window)` row of a `usage_summary` snapshot.
#[derive(Debug, Clone)]
pub struct UsageWindow {
    pub kind: &'static str,
    pub period: &'static str,
    pub used: u32,
    pub limit: Option<u32>,
}

/// Read-only usage snapshot across both kinds and all three windows,
/// returned by `QuotaChecker::usage_summary`.
#[derive(Debug, Clone)]
pub struct UsageSummary {
    pub windows: Vec<UsageWindow>,
}

/// Result of a successful `check` — not an error, even on denial.
#[derive(Debug, Clone)]
pub struct QuotaCheck {
    pub allowed: bool,
    pub limit_type: &'static str,
    pub limit: u32,
    pub used: u32,
    pub period: &'static str,
}

/// Per-client/-number burst counters, kept in memory since the burst window
/// is too short-lived to round-trip through the usage repository.
#[derive(Default)]
struct BurstCounters {
    sms_out: Vec<chrono::DateTime<Utc>>,
    mms_out: Vec<chrono::DateTime<Utc>>,
}

pub struct QuotaChecker {
    usage: Arc<dyn UsageRepository>,
    burst: DashMap<i64, BurstCounters>,
}

impl QuotaChecker {
    pub fn new(usage: Arc<dyn UsageRepository>) -> Self {
        QuotaChecker {
            usage,
            burst: DashMap::new(),
        }
    }

    fn daily_start(tz: chrono_tz::Tz, now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
        let local = now.with_timezone(&tz);
        let midnight = tz
            .with_ymd_and_hms(local.year(), local.month(), local.day(), 0, 0, 0)
            .single()
            .unwrap_or(local);
        midnight.with_timezone(&Utc)
    }

    fn monthly_start(tz: chrono_tz::Tz, now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
        let local = now.with_timezone(&tz);
        let first = tz
            .with_ymd_and_hms(local.year(), local.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(local);
        first.with_timezone(&Utc)
    }

    fn limit_for(client: &Client, number: Option<&Number>, kind: MessageKind, window: WindowKind) -> Option<u32> {
        let overrides = number.map(|n| &n.limits);
        match (kind, window) {
            (MessageKind::Sms, WindowKind::Burst) => overrides
                .and_then(|o| o.sms_burst_limit)
                .or(client.settings.sms_burst_limit),
            (MessageKind::Sms, WindowKind::Daily) => overrides
                .and_then(|o| o.sms_daily_limit)
                .or(client.settings.sms_daily_limit),
            (MessageKind::Sms, WindowKind::Monthly) => overrides
                .and_then(|o| o.sms_monthly_limit)
                .or(client.settings.sms_monthly_limit),
            (MessageKind::Mms, WindowKind::Burst) => overrides
                .and_then(|o| o.mms_burst_limit)
                .or(client.settings.mms_burst_limit),
            (MessageKind::Mms, WindowKind::Daily) => overrides
                .and_then(|o| o.mms_daily_limit)
                .or(client.settings.mms_daily_limit),
            (MessageKind::Mms, WindowKind::Monthly) => overrides
                .and_then(|o| o.mms_monthly_limit)
                .or(client.settings.mms_monthly_limit),
        }
    }

    /// Evaluate burst/daily/monthly windows for `(client, kind, direction)`.
    /// Only outbound consumes quota today;
    /// inbound is monitored only and always allowed.
    pub async fn check(
        &self,
        client: &Client,
        number: Option<&Number>,
        kind: MessageKind,
        direction: Direction,
    ) -> Result<QuotaCheck, QuotaError> {
        if direction == Direction::Inbound {
            return Ok(QuotaCheck {
                allowed: true,
                limit_type: "none",
                limit: 0,
                used: 0,
                period: "n/a",
            });
        }

        let now = Utc::now();
        let tz = client.timezone_or_utc();
        let kind_label = match kind {
            MessageKind::Sms => "SMS",
            MessageKind::Mms => "MMS",
        };

        for (window, since, period) in [
            (WindowKind::Burst, now - chrono::Duration::seconds(BURST_WINDOW.as_secs() as i64), "burst"),
            (WindowKind::Daily, Self::daily_start(tz, now), "daily"),
            (WindowKind::Monthly, Self::monthly_start(tz, now), "monthly"),
        ] {
            let Some(limit) = Self::limit_for(client, number, kind, window) else {
                continue;
            };
            let used = if window == WindowKind::Burst {
                self.burst_used(client.id, kind, since)
            } else {
                self.usage
                    .count_since(client.id, kind_label, "Outbound", since)
                    .await
                    .unwrap_or(0)
            };
            // Boundary: a counter sized at exactly `limit` is denied.
            if used >= limit {
                return Ok(QuotaCheck {
                    allowed: false,
                    limit_type: window.label(),
                    limit,
                    used,
                    period,
                });
            }
        }

        Ok(QuotaCheck {
            allowed: true,
            limit_type: "none",
            limit: 0,
            used: 0,
            period: "n/a",
        })
    }

    /// Current usage against each of the three windows for both message
    /// kinds, for the `GET /messages/usage` admin/client surface.
    /// Unlike `check`, this never denies — it is a read-only snapshot.
    pub async fn usage_summary(&self, client: &Client, number: Option<&Number>) -> UsageSummary {
        let now = Utc::now();
        let tz = client.timezone_or_utc();
        let mut windows = Vec::with_capacity(6);
        for kind in [MessageKind::Sms, MessageKind::Mms] {
            let kind_label = match kind {
                MessageKind::Sms => "SMS",
                MessageKind::Mms => "MMS",
            };
            for (window, since, period) in [
                (WindowKind::Burst, now - chrono::Duration::seconds(BURST_WINDOW.as_secs() as i64), "burst"),
                (WindowKind::Daily, Self::daily_start(tz, now), "daily"),
                (WindowKind::Monthly, Self::monthly_start(tz, now), "monthly"),
            ] {
                let limit = Self::limit_for(client, number, kind, window);
                let used = if window == WindowKind::Burst {
                    self.burst_used(client.id, kind, since)
                } else {
                    self.usage
                        .count_since(client.id, kind_label, "Outbound", since)
                        .await
                        .unwrap_or(0)
                };
                windows.push(UsageWindow {
                    kind: kind_label,
                    period,
                    used,
                    limit,
                });
            }
        }
        UsageSummary { windows }
    }

    fn burst_used(&self, client_id: i64, kind: MessageKind, since: chrono::DateTime<Utc>) -> u32 {
        let entry = self.burst.get(&client_id);
        match entry {
            Some(c) => {
                let list = match kind {
                    MessageKind::Sms => &c.sms_out,
                    MessageKind::Mms => &c.mms_out,
                };
                list.iter().filter(|&&t| t >= since).count() as u32
            }
            None => 0,
        }
    }

    /// Charge one successful outbound delivery against the burst counter.
    /// Daily/monthly counters are derived from `UsageRepository::count_since`
    /// against the usage record written by the Router, so no separate charge
    /// is needed there.
    pub fn charge_burst(&self, client_id: i64, kind: MessageKind) {
        let now = Utc::now();
        let mut entry = self.burst.entry(client_id).or_default();
        let list = match kind {
            MessageKind::Sms => &mut entry.sms_out,
            MessageKind::Mms => &mut entry.mms_out,
        };
        list.push(now);
        let cutoff = now - chrono::Duration::seconds(BURST_WINDOW.as_secs() as i64);
        list.retain(|&t| t >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApiFormat, ClientSettings, ClientType};
    use crate::repository::InMemoryUsageRepository;

    fn client_with_daily_limit(limit: u32) -> Client {
        Client {
            id: 1,
            username: "acme".into(),
            password_encrypted: String::new(),
            name: "Acme".into(),
            address: None,
            client_type: ClientType::Web,
            timezone: None,
            settings: ClientSettings {
                api_format: ApiFormat::Generic,
                sms_daily_limit: Some(limit),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn denies_at_exact_boundary() {
        let usage = Arc::new(InMemoryUsageRepository::default());
        for _ in 0..10 {
            usage
                .record(crate::domain::UsageRecord {
                    client_id: 1,
                    direction: Direction::Outbound,
                    from_type: "SMS",
                    to_type: "SMS",
                    delivery_method: crate::domain::DeliveryMethod::CarrierApi,
                    carrier: None,
                    encoding: None,
                    segments: 1,
                    bytes: 2,
                    media_count: 0,
                    source_ip: String::new(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let checker = QuotaChecker::new(usage);
        let client = client_with_daily_limit(10);
        let result = checker
            .check(&client, None, MessageKind::Sms, Direction::Outbound)
            .await
            .unwrap();
        assert!(!result.allowed);
        assert_eq!(result.limit_type, "daily");
    }

    #[tokio::test]
    async fn inbound_never_denied() {
        let usage = Arc::new(InMemoryUsageRepository::default());
        let checker = QuotaChecker::new(usage);
        let client = client_with_daily_limit(0);
        let result = checker
            .check(&client, None, MessageKind::Sms, Direction::Inbound)
            .await
            .unwrap();
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn burst_charge_denies_after_limit() {
        let usage = Arc::new(InMemoryUsageRepository::default());
        let checker = QuotaChecker::new(usage);
        let mut client = client_with_daily_limit(1000);
        client.settings.sms_burst_limit = Some(2);
        checker.charge_burst(client.id, MessageKind::Sms);
        checker.charge_burst(client.id, MessageKind::Sms);
        let result = checker
            .check(&client, None, MessageKind::Sms, Direction::Outbound)
            .await
            .unwrap();
        assert!(!result.allowed);
        assert_eq!(result.limit_type, "burst");
    }
}
