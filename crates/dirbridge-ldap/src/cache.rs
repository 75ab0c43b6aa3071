//! Per-endpoint, TTL-governed cache of resolved group memberships.

use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DirectoryEndpoint;
use crate::dn::normalize_dn;
use crate::entry::MembershipIndex;
use crate::resolver::GroupResolution;

/// Result of a membership lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// The reference is a group with these leaf members.
    Group(Arc<MembershipIndex>),
    /// The reference is not a group (or could not be resolved).
    NotAGroup,
}

impl Membership {
    /// Returns true for [`Membership::Group`].
    #[must_use]
    pub const fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    /// Members of a group.
    #[must_use]
    pub fn members(&self) -> Option<&MembershipIndex> {
        match self {
            Self::Group(members) => Some(members),
            Self::NotAGroup => None,
        }
    }

    /// DN of the member matching `account` (identifier, DN, or `uid_attribute=account` prefix).
    #[must_use]
    pub fn find_member(&self, account: &str, uid_attribute: &str) -> Option<&str> {
        self.members()
            .and_then(|members| members.find_member(account, uid_attribute))
    }
}

#[derive(Debug, Clone)]
struct CachedMembers {
    members: Arc<MembershipIndex>,
    inserted_at: Instant,
    ttl: Duration,
}

impl CachedMembers {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found no live entry.
    pub misses: u64,
    /// Entries dropped because their TTL passed.
    pub expirations: u64,
    /// Resolutions run on a miss.
    pub resolutions: u64,
    /// Live and not yet evicted entries.
    pub entries: usize,
}

/// Membership cache shared by every caller of one host application.
///
/// Entries live in one bucket per endpoint (see [`MembershipCache::bucket_key`]) and are keyed
/// by normalised group reference. Resolution runs outside any lock, so concurrent misses on the
/// same key may both resolve; the last write wins.
#[derive(Debug, Default)]
pub struct MembershipCache {
    buckets: DashMap<String, HashMap<String, CachedMembers>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    resolutions: AtomicU64,
}

impl MembershipCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket identifying `endpoint` as seen through `uid_attribute` (`uid.host:port`).
    #[must_use]
    pub fn bucket_key(endpoint: &DirectoryEndpoint, uid_attribute: &str) -> String {
        format!(
            "{}.{}",
            uid_attribute.to_ascii_lowercase(),
            endpoint.signature().to_ascii_lowercase()
        )
    }

    /// Live entry for `group`, if any. Expired entries are removed.
    #[must_use]
    pub fn get(&self, bucket: &str, group: &str) -> Option<Arc<MembershipIndex>> {
        let key = normalize_dn(group);
        let now = Instant::now();

        let found = self.buckets.get_mut(bucket).and_then(|mut entries| {
            let cached = entries.get(&key)?;
            if !cached.is_expired(now) {
                return Some(cached.members.clone());
            }
            entries.remove(&key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(bucket, group, "cached membership expired");
            None
        });

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Stores `members` for `ttl`. A zero TTL stores nothing.
    ///
    /// Expired entries of the same bucket are purged first.
    pub fn insert(&self, bucket: &str, group: &str, members: Arc<MembershipIndex>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.buckets.entry(bucket.to_string()).or_default();

        let before = entries.len();
        entries.retain(|_, cached| !cached.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            self.expirations
                .fetch_add(u64::try_from(purged).unwrap_or(u64::MAX), Ordering::Relaxed);
            debug!(bucket, purged, "expired memberships purged");
        }

        entries.insert(
            normalize_dn(group),
            CachedMembers {
                members,
                inserted_at: now,
                ttl,
            },
        );
    }

    /// Returns the cached membership of `group`, running `resolve` on a miss.
    ///
    /// Only confirmed groups are stored; a non-group is resolved again on every call.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        bucket: &str,
        group: &str,
        ttl: Duration,
        resolve: F,
    ) -> Membership
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GroupResolution>,
    {
        if let Some(members) = self.get(bucket, group) {
            return Membership::Group(members);
        }

        self.resolutions.fetch_add(1, Ordering::Relaxed);
        let resolution = resolve().await;
        if !resolution.is_group {
            debug!(bucket, group, "reference is not a group, not caching");
            return Membership::NotAGroup;
        }

        let members = Arc::new(resolution.members);
        self.insert(bucket, group, members.clone(), ttl);
        Membership::Group(members)
    }

    /// Drops one entry. Returns true if it was present.
    pub fn invalidate_group(&self, bucket: &str, group: &str) -> bool {
        self.buckets
            .get_mut(bucket)
            .is_some_and(|mut entries| entries.remove(&normalize_dn(group)).is_some())
    }

    /// Drops every entry of one endpoint bucket.
    pub fn invalidate_endpoint(&self, bucket: &str) {
        if self.buckets.remove(bucket).is_some() {
            debug!(bucket, "membership cache bucket invalidated");
        }
    }

    /// Drops everything.
    pub fn invalidate_all(&self) {
        self.buckets.clear();
        debug!("membership cache cleared");
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            resolutions: self.resolutions.load(Ordering::Relaxed),
            entries: self.buckets.iter().map(|bucket| bucket.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const BUCKET: &str = "uid.ldap.example.com:389";

    fn eng() -> GroupResolution {
        let mut members = MembershipIndex::new();
        members.insert("uid=alice,ou=People", "alice");
        members.insert("uid=bob,ou=People", "bob");
        GroupResolution {
            is_group: true,
            members,
        }
    }

    async fn lookup(cache: &MembershipCache, group: &str, ttl: Duration, calls: &AtomicUsize) -> Membership {
        cache
            .get_or_resolve(BUCKET, group, ttl, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                eng()
            })
            .await
    }

    #[tokio::test]
    async fn warm_cache_returns_identical_content() {
        let cache = MembershipCache::new();
        let calls = AtomicUsize::new(0);

        let first = lookup(&cache, "cn=Eng,ou=Groups", Duration::from_secs(60), &calls).await;
        let second = lookup(&cache, "CN=Eng, OU=Groups", Duration::from_secs(60), &calls).await;
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            first.find_member("alice", "uid"),
            Some("uid=alice,ou=People")
        );

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.resolutions), (1, 1, 1));
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_resolved_again() {
        let cache = MembershipCache::new();
        let calls = AtomicUsize::new(0);
        let ttl = Duration::from_secs(1);

        lookup(&cache, "cn=Eng,ou=Groups", ttl, &calls).await;
        tokio::time::advance(Duration::from_millis(500)).await;
        lookup(&cache, "cn=Eng,ou=Groups", ttl, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(cache.get(BUCKET, "cn=Eng,ou=Groups").is_none());
        lookup(&cache, "cn=Eng,ou=Groups", ttl, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn insert_purges_expired_entries_of_the_bucket() {
        let cache = MembershipCache::new();
        let members = Arc::new(eng().members);
        cache.insert(BUCKET, "cn=Eng,ou=Groups", members.clone(), Duration::from_secs(1));
        cache.insert("cn.other.example.com:389", "cn=Eng,ou=Groups", members.clone(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.insert(BUCKET, "cn=Ops,ou=Groups", members, Duration::from_secs(60));

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        // The other bucket is only purged by its own inserts or lookups.
        assert_eq!(stats.entries, 2);
        assert!(cache.get(BUCKET, "cn=Ops,ou=Groups").is_some());
        assert!(cache.get(BUCKET, "cn=Eng,ou=Groups").is_none());
    }

    #[tokio::test]
    async fn non_groups_are_never_cached() {
        let cache = MembershipCache::new();
        let calls = &AtomicUsize::new(0);

        for _ in 0..3 {
            let membership = cache
                .get_or_resolve(BUCKET, "uid=dave,ou=People", Duration::from_secs(60), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    GroupResolution::default()
                })
                .await;
            assert_eq!(membership, Membership::NotAGroup);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn zero_ttl_disables_storage() {
        let cache = MembershipCache::new();
        let calls = AtomicUsize::new(0);

        let membership = lookup(&cache, "cn=Eng,ou=Groups", Duration::ZERO, &calls).await;
        assert!(membership.is_group());
        lookup(&cache, "cn=Eng,ou=Groups", Duration::ZERO, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn buckets_are_independent() {
        let cache = MembershipCache::new();
        let members = Arc::new(eng().members);
        cache.insert(BUCKET, "cn=Eng,ou=Groups", members.clone(), Duration::from_secs(60));
        cache.insert(
            "cn.other.example.com:389",
            "cn=Eng,ou=Groups",
            members,
            Duration::from_secs(60),
        );

        assert!(cache.get("cn.ldap.example.com:389", "cn=Eng,ou=Groups").is_none());

        cache.invalidate_endpoint(BUCKET);
        assert!(cache.get(BUCKET, "cn=Eng,ou=Groups").is_none());
        assert!(cache
            .get("cn.other.example.com:389", "cn=Eng,ou=Groups")
            .is_some());

        assert!(cache.invalidate_group("cn.other.example.com:389", "CN=Eng,OU=Groups"));
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn invalidate_all_forces_resolution() {
        let cache = MembershipCache::new();
        let calls = AtomicUsize::new(0);

        lookup(&cache, "cn=Eng,ou=Groups", Duration::from_secs(60), &calls).await;
        cache.invalidate_all();
        lookup(&cache, "cn=Eng,ou=Groups", Duration::from_secs(60), &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bucket_key_combines_uid_and_endpoint() {
        let endpoint = DirectoryEndpoint::new("LDAP.example.com", 636, true);
        assert_eq!(
            MembershipCache::bucket_key(&endpoint, "UID"),
            "uid.ldap.example.com:636"
        );
    }
}
