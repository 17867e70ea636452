//! Per-identity behavior profiles.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;

use crate::domain::OperationalEvent;

const MAX_REQUEST_SAMPLES: usize = 100;
const MAX_RECENT_ACTIONS: usize = 10;
const DEFAULT_MAX_PROFILES: usize = 100_000;

/// Established behavior of one identity (planter, user or source IP).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IdentityProfile {
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub locations: BTreeSet<String>,
    /// UTC hours of day with observed access.
    pub access_hours: BTreeSet<u32>,
    pub request_counts: VecDeque<f64>,
    pub resources: BTreeSet<String>,
    pub recent_actions: VecDeque<String>,
}

impl IdentityProfile {
    /// Rolling mean of the reported request counts; 0 with no samples.
    pub fn average_request_rate(&self) -> f64 {
        if self.request_counts.is_empty() {
            return 0.0;
        }
        self.request_counts.iter().sum::<f64>() / self.request_counts.len() as f64
    }

    /// Fold one event into the profile.
    pub fn absorb(&mut self, event: &OperationalEvent) {
        self.first_seen.get_or_insert(event.timestamp);
        self.last_seen = Some(event.timestamp);
        self.access_hours.insert(event.timestamp.hour());

        if let Some(location) = &event.location {
            self.locations.insert(location.clone());
        }
        if let Some(resource) = &event.resource {
            self.resources.insert(resource.clone());
        }
        if let Some(count) = event.metrics.get("request_count") {
            self.request_counts.push_back(*count);
            if self.request_counts.len() > MAX_REQUEST_SAMPLES {
                self.request_counts.pop_front();
            }
        }
    }
}

/// Keyed profile state, injected into the detectors that need it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Current profile; an empty one for unseen identities.
    async fn snapshot(&self, identity: &str) -> IdentityProfile;

    /// Fold `event` into the identity's profile.
    async fn record(&self, identity: &str, event: &OperationalEvent);

    /// Append an action and return the actions recorded before it, oldest
    /// first.
    async fn push_action(&self, identity: &str, action: &str) -> Vec<String>;
}

/// Profiles held in process, bounded in count and idle age.
///
/// Live traffic keys profiles by source address, so identities come and go.
/// When a new identity would exceed `max_profiles`, idle profiles are dropped
/// first, then the least recently touched one.
pub struct InMemoryProfileStore {
    profiles: DashMap<String, TrackedProfile>,
    max_profiles: usize,
    idle_ttl: chrono::Duration,
    clock: AtomicU64,
}

struct TrackedProfile {
    profile: IdentityProfile,
    touched_at: DateTime<Utc>,
    touch_seq: u64,
}

impl Default for InMemoryProfileStore {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_PROFILES, chrono::Duration::hours(24))
    }
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_profiles: usize, idle_ttl: chrono::Duration) -> Self {
        Self {
            profiles: DashMap::new(),
            max_profiles: max_profiles.max(1),
            idle_ttl,
            clock: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Drop profiles untouched for longer than the idle TTL.
    pub fn prune_idle(&self) -> usize {
        let cutoff = Utc::now() - self.idle_ttl;
        let before = self.profiles.len();
        self.profiles.retain(|_, tracked| tracked.touched_at >= cutoff);
        before.saturating_sub(self.profiles.len())
    }

    /// Make room for `identity` if it is new and the store is full.
    fn reserve(&self, identity: &str) {
        if self.profiles.len() < self.max_profiles || self.profiles.contains_key(identity) {
            return;
        }
        let pruned = self.prune_idle();
        while self.profiles.len() >= self.max_profiles {
            let Some(victim) = self
                .profiles
                .iter()
                .min_by_key(|entry| entry.touch_seq)
                .map(|entry| entry.key().clone())
            else {
                break;
            };
            self.profiles.remove(&victim);
            tracing::debug!(identity = %victim, "Evicted least recently seen profile");
        }
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped idle profiles");
        }
    }

    /// Run `update` on the identity's profile, creating it if needed.
    fn touch<R>(&self, identity: &str, update: impl FnOnce(&mut IdentityProfile) -> R) -> R {
        self.reserve(identity);
        let seq = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut tracked = self
            .profiles
            .entry(identity.to_string())
            .or_insert_with(|| TrackedProfile {
                profile: IdentityProfile::default(),
                touched_at: Utc::now(),
                touch_seq: seq,
            });
        tracked.touched_at = Utc::now();
        tracked.touch_seq = seq;
        update(&mut tracked.profile)
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn snapshot(&self, identity: &str) -> IdentityProfile {
        self.profiles
            .get(identity)
            .map(|tracked| tracked.profile.clone())
            .unwrap_or_default()
    }

    async fn record(&self, identity: &str, event: &OperationalEvent) {
        self.touch(identity, |profile| profile.absorb(event));
    }

    async fn push_action(&self, identity: &str, action: &str) -> Vec<String> {
        self.touch(identity, |profile| {
            let previous: Vec<String> = profile.recent_actions.iter().cloned().collect();
            profile.recent_actions.push_back(action.to_string());
            if profile.recent_actions.len() > MAX_RECENT_ACTIONS {
                profile.recent_actions.pop_front();
            }
            previous
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_builds_profile() {
        let store = InMemoryProfileStore::new();
        let event = OperationalEvent::new("10.0.0.1")
            .location("Port-au-Prince")
            .resource("/evidence")
            .metric("request_count", 12.0);

        store.record("planter-1", &event).await;
        store.record("planter-1", &event.clone().metric("request_count", 8.0)).await;

        let profile = store.snapshot("planter-1").await;
        assert_eq!(profile.locations.len(), 1);
        assert_eq!(profile.average_request_rate(), 10.0);
        assert!(profile.resources.contains("/evidence"));
        assert!(store.snapshot("someone-else").await.locations.is_empty());
    }

    #[tokio::test]
    async fn actions_are_bounded_and_returned_before_push() {
        let store = InMemoryProfileStore::new();
        assert!(store.push_action("u", "login").await.is_empty());
        assert_eq!(store.push_action("u", "payment_init").await, vec!["login"]);

        for i in 0..20 {
            store.push_action("u", &format!("a{i}")).await;
        }
        let previous = store.push_action("u", "last").await;
        assert_eq!(previous.len(), MAX_RECENT_ACTIONS);
        assert_eq!(previous.last().map(String::as_str), Some("a19"));
    }

    #[tokio::test]
    async fn full_store_evicts_least_recently_seen() {
        let store = InMemoryProfileStore::with_limits(2, chrono::Duration::hours(1));
        let event = OperationalEvent::new("10.0.0.1").resource("/evidence");

        store.record("10.0.0.1", &event).await;
        store.record("10.0.0.2", &event).await;
        store.record("10.0.0.1", &event).await;
        store.record("10.0.0.3", &event).await;

        assert_eq!(store.len(), 2);
        assert!(store.snapshot("10.0.0.2").await.resources.is_empty());
        assert!(!store.snapshot("10.0.0.1").await.resources.is_empty());
        assert!(!store.snapshot("10.0.0.3").await.resources.is_empty());
    }

    #[tokio::test]
    async fn idle_profiles_are_dropped_first() {
        let store = InMemoryProfileStore::with_limits(2, chrono::Duration::milliseconds(5));
        store.push_action("a", "login").await;
        store.push_action("b", "login").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        store.push_action("c", "login").await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.push_action("c", "logout").await, vec!["login"]);
    }
}
