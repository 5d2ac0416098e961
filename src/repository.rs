// ABOUTME: Repository contracts for clients/numbers/carriers/media/usage
// ABOUTME: Plus an in-memory reference implementation with copy-on-write reload

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Carrier, Client, MediaRecord, Number, UsageRecord};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found")]
    NotFound,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Read-mostly client lookup. Concrete production implementations (a
/// relational store, spec §6) are out of scope; this trait is the contract
/// the Router and admin surface depend on.
#[async_trait]
pub trait ClientRepository: Send + Sync {
    async fn by_id(&self, id: i64) -> Result<Option<Client>, RepositoryError>;
    async fn by_username(&self, username: &str) -> Result<Option<Client>, RepositoryError>;
    /// Look up the legacy client whose IP ACL (`address`) matches a peer
    /// connecting to the short-message or SMTP-framed server.
    async fn by_address(&self, address: &str) -> Result<Option<Client>, RepositoryError>;
    /// Every currently-visible client, for the admin listing surface — a reference capability, not a production query path.
    async fn list(&self) -> Result<Vec<Client>, RepositoryError>;
    async fn upsert(&self, client: Client) -> Result<(), RepositoryError>;
    async fn delete(&self, id: i64) -> Result<(), RepositoryError>;
    /// Atomically swap the read snapshot used by routing lookups.
    async fn reload(&self) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait NumberRepository: Send + Sync {
    /// Normalized E.164 is the unique lookup key.
    async fn by_e164(&self, e164: &str) -> Result<Option<Number>, RepositoryError>;
    async fn for_client(&self, client_id: i64) -> Result<Vec<Number>, RepositoryError>;
    async fn by_id(&self, id: i64) -> Result<Option<Number>, RepositoryError>;
    async fn upsert(&self, number: Number) -> Result<(), RepositoryError>;
    async fn delete(&self, id: i64) -> Result<(), RepositoryError>;
    async fn reload(&self) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait CarrierRepository: Send + Sync {
    async fn by_name(&self, name: &str) -> Result<Option<Carrier>, RepositoryError>;
    async fn list(&self) -> Result<Vec<Carrier>, RepositoryError>;
    async fn upsert(&self, carrier: Carrier) -> Result<(), RepositoryError>;
    async fn reload(&self) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MediaRepository: Send + Sync {
    async fn put(&self, record: MediaRecord) -> Result<(), RepositoryError>;
    async fn get(&self, id: uuid::Uuid) -> Result<Option<MediaRecord>, RepositoryError>;
    /// Delete every record whose TTL has elapsed; returns the count removed.
    async fn sweep_expired(&self) -> Result<usize, RepositoryError>;
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn record(&self, usage: UsageRecord) -> Result<(), RepositoryError>;
    /// Count of successful outbound deliveries for `client_id` of `kind`
    /// since `since` — the primitive the quota checker's rolling windows
    /// are built on.
    async fn count_since(
        &self,
        client_id: i64,
        kind_label: &'static str,
        direction_label: &'static str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<u32, RepositoryError>;
}

/// A simple copy-on-write in-memory snapshot, matching spec §5/§9's
/// "two atomically swapped immutable snapshots" pattern via `arc-swap`.
struct Snapshot {
    by_id: HashMap<i64, Client>,
    by_username: HashMap<String, i64>,
}

impl Snapshot {
    fn empty() -> Self {
        Snapshot {
            by_id: HashMap::new(),
            by_username: HashMap::new(),
        }
    }
}

/// In-memory reference implementation, used by tests and examples — not a
/// production store.
pub struct InMemoryClientRepository {
    staged: dashmap::DashMap<i64, Client>,
    snapshot: ArcSwap<Snapshot>,
}

impl Default for InMemoryClientRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryClientRepository {
    pub fn new() -> Self {
        InMemoryClientRepository {
            staged: dashmap::DashMap::new(),
            snapshot: ArcSwap::from_pointee(Snapshot::empty()),
        }
    }
}

#[async_trait]
impl ClientRepository for InMemoryClientRepository {
    async fn by_id(&self, id: i64) -> Result<Option<Client>, RepositoryError> {
        Ok(self.snapshot.load().by_id.get(&id).cloned())
    }

    async fn by_username(&self, username: &str) -> Result<Option<Client>, RepositoryError> {
        let snap = self.snapshot.load();
        Ok(snap
            .by_username
            .get(username)
            .and_then(|id| snap.by_id.get(id))
            .cloned())
    }

    async fn by_address(&self, address: &str) -> Result<Option<Client>, RepositoryError> {
        Ok(self
            .snapshot
            .load()
            .by_id
            .values()
            .find(|c| c.address.as_deref() == Some(address))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Client>, RepositoryError> {
        Ok(self.snapshot.load().by_id.values().cloned().collect())
    }

    async fn upsert(&self, client: Client) -> Result<(), RepositoryError> {
        self.staged.insert(client.id, client);
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        self.staged.remove(&id);
        let mut next = Snapshot::empty();
        for entry in self.snapshot.load().by_id.iter() {
            if *entry.0 != id {
                next.by_username
                    .insert(entry.1.username.clone(), *entry.0);
                next.by_id.insert(*entry.0, entry.1.clone());
            }
        }
        self.snapshot.store(Arc::new(next));
        Ok(())
    }

    async fn reload(&self) -> Result<(), RepositoryError> {
        let mut next = Snapshot::empty();
        for entry in self.staged.iter() {
            next.by_username
                .insert(entry.value().username.clone(), *entry.key());
            next.by_id.insert(*entry.key(), entry.value().clone());
        }
        self.snapshot.store(Arc::new(next));
        Ok(())
    }
}

/// In-memory number repository, same copy-on-write shape as
/// `InMemoryClientRepository`.
pub struct InMemoryNumberRepository {
    staged: dashmap::DashMap<i64, Number>,
    by_e164: ArcSwap<HashMap<String, Number>>,
}

impl Default for InMemoryNumberRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNumberRepository {
    pub fn new() -> Self {
        InMemoryNumberRepository {
            staged: dashmap::DashMap::new(),
            by_e164: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

#[async_trait]
impl NumberRepository for InMemoryNumberRepository {
    async fn by_e164(&self, e164: &str) -> Result<Option<Number>, RepositoryError> {
        Ok(self.by_e164.load().get(e164).cloned())
    }

    async fn for_client(&self, client_id: i64) -> Result<Vec<Number>, RepositoryError> {
        Ok(self
            .by_e164
            .load()
            .values()
            .filter(|n| n.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn by_id(&self, id: i64) -> Result<Option<Number>, RepositoryError> {
        Ok(self.by_e164.load().values().find(|n| n.id == id).cloned())
    }

    async fn upsert(&self, number: Number) -> Result<(), RepositoryError> {
        self.staged.insert(number.id, number);
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), RepositoryError> {
        self.staged.remove(&id);
        self.reload().await
    }

    async fn reload(&self) -> Result<(), RepositoryError> {
        let mut next = HashMap::new();
        for entry in self.staged.iter() {
            next.insert(entry.value().e164.clone(), entry.value().clone());
        }
        self.by_e164.store(Arc::new(next));
        Ok(())
    }
}

pub struct InMemoryCarrierRepository {
    by_name: dashmap::DashMap<String, Carrier>,
}

impl Default for InMemoryCarrierRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCarrierRepository {
    pub fn new() -> Self {
        InMemoryCarrierRepository {
            by_name: dashmap::DashMap::new(),
        }
    }
}

#[async_trait]
impl CarrierRepository for InMemoryCarrierRepository {
    async fn by_name(&self, name: &str) -> Result<Option<Carrier>, RepositoryError> {
        Ok(self.by_name.get(name).map(|r| r.clone()))
    }

    async fn list(&self) -> Result<Vec<Carrier>, RepositoryError> {
        Ok(self.by_name.iter().map(|e| e.value().clone()).collect())
    }

    async fn upsert(&self, carrier: Carrier) -> Result<(), RepositoryError> {
        self.by_name.insert(carrier.name.clone(), carrier);
        Ok(())
    }

    async fn reload(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryMediaRepository {
    store: dashmap::DashMap<uuid::Uuid, MediaRecord>,
}

#[async_trait]
impl MediaRepository for InMemoryMediaRepository {
    async fn put(&self, record: MediaRecord) -> Result<(), RepositoryError> {
        self.store.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: uuid::Uuid) -> Result<Option<MediaRecord>, RepositoryError> {
        Ok(self.store.get(&id).map(|r| r.clone()))
    }

    async fn sweep_expired(&self) -> Result<usize, RepositoryError> {
        let now = chrono::Utc::now();
        let expired: Vec<uuid::Uuid> = self
            .store
            .iter()
            .filter(|e| e.value().expired(now))
            .map(|e| *e.key())
            .collect();
        for id in &expired {
            self.store.remove(id);
        }
        Ok(expired.len())
    }
}

#[derive(Default)]
pub struct InMemoryUsageRepository {
    records: dashmap::DashMap<u64, UsageRecord>,
    next_id: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn record(&self, usage: UsageRecord) -> Result<(), RepositoryError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.records.insert(id, usage);
        Ok(())
    }

    async fn count_since(
        &self,
        client_id: i64,
        kind_label: &'static str,
        direction_label: &'static str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<u32, RepositoryError> {
        let count = self
            .records
            .iter()
            .filter(|e| {
                let u = e.value();
                u.client_id == client_id
                    && u.created_at >= since
                    && format!("{:?}", u.direction) == direction_label
                    && u.from_type == kind_label
            })
            .count();
        Ok(count as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApiFormat, ClientSettings, ClientType};

    fn test_client(id: i64, username: &str) -> Client {
        Client {
            id,
            username: username.to_string(),
            password_encrypted: String::new(),
            name: username.to_string(),
            address: None,
            client_type: ClientType::Web,
            timezone: None,
            settings: ClientSettings {
                api_format: ApiFormat::Generic,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn reload_makes_upsert_visible() {
        let repo = InMemoryClientRepository::new();
        assert!(repo.by_username("bicom").await.unwrap().is_none());
        repo.upsert(test_client(1, "bicom")).await.unwrap();
        assert!(repo.by_username("bicom").await.unwrap().is_none());
        repo.reload().await.unwrap();
        assert!(repo.by_username("bicom").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn media_sweep_removes_only_expired() {
        let repo = InMemoryMediaRepository::default();
        let mut fresh = MediaRecord::new("a.jpg".into(), "image/jpeg".into(), vec![1, 2, 3]);
        let mut stale = MediaRecord::new("b.jpg".into(), "image/jpeg".into(), vec![4, 5, 6]);
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        fresh.expires_at = chrono::Utc::now() + chrono::Duration::days(1);
        let fresh_id = fresh.id;
        repo.put(fresh).await.unwrap();
        repo.put(stale).await.unwrap();
        let removed = repo.sweep_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get(fresh_id).await.unwrap().is_some());
    }
}
