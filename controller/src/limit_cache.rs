//! C6: short-TTL memoization in front of the subscription API.
//!
//! The subscription API's `GET /api/users/by-id/{id}` returns `uuid` and
//! `hwidDeviceLimit` in one call, and both are equally cache-worthy at the
//! same TTL (spec §4.8 step 2 calls the uuid lookup out explicitly as
//! "cache-worthy, same TTL as limits") — so one cache entry serves both the
//! limit check (C7) and the uuid resolution the enforcement coordinator
//! needs (C8), instead of two independent caches hitting the same endpoint.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::subscription_api::SubscriptionApiClient;

#[derive(Debug, Clone)]
struct CachedInfo {
    uuid: String,
    limit: u32,
    fetched_at: Instant,
}

pub struct LimitCache {
    api: SubscriptionApiClient,
    ttl: Duration,
    entries: DashMap<String, CachedInfo>,
}

impl LimitCache {
    pub fn new(api: SubscriptionApiClient, ttl: Duration) -> LimitCache {
        LimitCache {
            api,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// `limit == 0` and "not enrolled" collapse to `None` at this layer
    /// (spec §4.6): callers never need to distinguish them.
    pub async fn get_limit(&self, subscriber_id: &str) -> Option<u32> {
        self.get_info(subscriber_id).await.and_then(|info| {
            if info.limit == 0 {
                None
            } else {
                Some(info.limit)
            }
        })
    }

    pub async fn get_uuid(&self, subscriber_id: &str) -> Option<String> {
        self.get_info(subscriber_id).await.map(|info| info.uuid)
    }

    async fn get_info(&self, subscriber_id: &str) -> Option<CachedInfo> {
        if let Some(cached) = self.entries.get(subscriber_id) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Some(cached.clone());
            }
        }

        match self.api.get_user(subscriber_id).await {
            Ok(record) => {
                let info = CachedInfo {
                    uuid: record.uuid,
                    limit: record.hwid_device_limit.unwrap_or(0),
                    fetched_at: Instant::now(),
                };
                self.entries.insert(subscriber_id.to_owned(), info.clone());
                Some(info)
            }
            Err(_) => {
                // On failure we return none without caching (spec §4.6) —
                // a transient API outage should not pin a stale "no limit"
                // decision past its TTL.
                None
            }
        }
    }

    pub fn prune(&self, max_age: Duration) -> usize {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|kv| kv.value().fetched_at.elapsed() > max_age)
            .map(|kv| kv.key().clone())
            .collect();
        for key in &stale {
            self.entries.remove(key);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::routing::get;
    use axum::{Json, Router};

    #[derive(Clone)]
    struct FakeUserApi {
        uuid: String,
        limit: Arc<AtomicU32>,
        calls: Arc<AtomicUsize>,
    }

    async fn fake_get_user(State(state): State<FakeUserApi>, Path(_id): Path<String>) -> Json<serde_json::Value> {
        state.calls.fetch_add(1, Ordering::SeqCst);
        Json(serde_json::json!({
            "uuid": state.uuid,
            "hwidDeviceLimit": state.limit.load(Ordering::SeqCst),
        }))
    }

    /// Spins up a tiny local stand-in for the subscription API's
    /// `GET /api/users/by-id/{id}` so `LimitCache`'s own caching behavior can
    /// be exercised without a reachable upstream.
    async fn spawn_fake_api(uuid: &str, limit: u32) -> (String, Arc<AtomicU32>, Arc<AtomicUsize>) {
        let limit = Arc::new(AtomicU32::new(limit));
        let calls = Arc::new(AtomicUsize::new(0));
        let state = FakeUserApi { uuid: uuid.to_owned(), limit: limit.clone(), calls: calls.clone() };
        let app = Router::new()
            .route("/api/users/by-id/{id}", get(fake_get_user))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        (format!("http://{}", addr), limit, calls)
    }

    /// Spec §4.6: `limit == 0` collapses to `None` in `get_limit`, but
    /// `get_uuid` still resolves the same record normally.
    #[tokio::test]
    async fn zero_limit_collapses_to_none_but_uuid_still_resolves() {
        let (base_url, _limit, _calls) = spawn_fake_api("uuid-zero", 0).await;
        let api = SubscriptionApiClient::new(base_url, "token".to_owned());
        let cache = LimitCache::new(api, Duration::from_secs(60));

        assert_eq!(cache.get_limit("dana").await, None);
        assert_eq!(cache.get_uuid("dana").await, Some("uuid-zero".to_owned()));
    }

    /// Spec §4.6: a second lookup within the TTL is served from cache (no
    /// extra upstream call); once the TTL has elapsed, the next lookup
    /// refetches and picks up the upstream's current value.
    #[tokio::test]
    async fn ttl_serves_cache_hit_then_refetches_after_expiry() {
        let (base_url, limit, calls) = spawn_fake_api("uuid-ttl", 3).await;
        let api = SubscriptionApiClient::new(base_url, "token".to_owned());
        let cache = LimitCache::new(api, Duration::from_millis(30));

        assert_eq!(cache.get_limit("erin").await, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Within the TTL: cache hit, no second upstream call.
        assert_eq!(cache.get_limit("erin").await, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        limit.store(5, Ordering::SeqCst);

        // Past the TTL: must refetch and observe the new upstream value.
        assert_eq!(cache.get_limit("erin").await, Some(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
