// ABOUTME: Tenant domain model — clients, numbers, carriers and their settings
// ABOUTME: Persistence of these types is out of scope; this module is the shape only

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    Legacy,
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiFormat {
    Generic,
    Bicom,
    Telnyx,
}

/// Per-tenant configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub api_format: ApiFormat,
    pub default_webhook: Option<String>,
    pub sms_burst_limit: Option<u32>,
    pub sms_daily_limit: Option<u32>,
    pub sms_monthly_limit: Option<u32>,
    pub mms_burst_limit: Option<u32>,
    pub mms_daily_limit: Option<u32>,
    pub mms_monthly_limit: Option<u32>,
    pub webhook_timeout_secs: Option<u64>,
    pub split_messages_always: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            api_format: ApiFormat::Generic,
            default_webhook: None,
            sms_burst_limit: None,
            sms_daily_limit: None,
            sms_monthly_limit: None,
            mms_burst_limit: None,
            mms_daily_limit: None,
            mms_monthly_limit: None,
            webhook_timeout_secs: None,
            split_messages_always: false,
        }
    }
}

/// A tenant. `password` is encrypted at rest by the repository implementation
/// (out of scope here, spec §2) — this struct carries the ciphertext, never
/// plaintext, once it leaves the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_encrypted: String,
    pub name: String,
    /// IP ACL for legacy binds/SMTP.
    pub address: Option<String>,
    pub client_type: ClientType,
    pub timezone: Option<Tz>,
    pub settings: ClientSettings,
}

impl Client {
    pub fn timezone_or_utc(&self) -> Tz {
        self.timezone.unwrap_or(chrono_tz::UTC)
    }
}

/// Per-number overrides on top of the owning client's limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NumberLimitOverrides {
    pub sms_burst_limit: Option<u32>,
    pub sms_daily_limit: Option<u32>,
    pub sms_monthly_limit: Option<u32>,
    pub mms_burst_limit: Option<u32>,
    pub mms_daily_limit: Option<u32>,
    pub mms_monthly_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Number {
    pub id: i64,
    pub client_id: i64,
    /// Normalized E.164; unique key for lookup.
    pub e164: String,
    pub carrier_name: String,
    pub tag: Option<String>,
    pub group: Option<String>,
    pub webhook_url: Option<String>,
    pub suppress_stop_autoreply: bool,
    pub limits: NumberLimitOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CarrierType {
    Http,
    Smpp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Carrier {
    pub id: i64,
    pub name: String,
    pub carrier_type: CarrierType,
    #[serde(skip_serializing)]
    pub credentials_encrypted: String,
    pub profile_id: Option<String>,
}

/// Persisted media blob metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: uuid::Uuid,
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl MediaRecord {
    pub const TTL_DAYS: i64 = 7;

    pub fn new(filename: String, mime: String, bytes: Vec<u8>) -> Self {
        let created_at = chrono::Utc::now();
        MediaRecord {
            id: uuid::Uuid::new_v4(),
            filename,
            mime,
            bytes,
            created_at,
            expires_at: created_at + chrono::Duration::days(Self::TTL_DAYS),
        }
    }

    pub fn expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Direction of a message relative to the gateway, used by usage records and
/// the quota checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMethod {
    Webhook,
    SmppSession,
    Mm4,
    CarrierApi,
}

/// Per-message audit/quota record, written after a
/// successful delivery only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub client_id: i64,
    pub direction: Direction,
    pub from_type: &'static str,
    pub to_type: &'static str,
    pub delivery_method: DeliveryMethod,
    pub carrier: Option<String>,
    pub encoding: Option<String>,
    pub segments: u32,
    pub bytes: u64,
    pub media_count: u32,
    pub source_ip: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
