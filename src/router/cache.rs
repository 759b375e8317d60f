//! 分流结果缓存
//!
//! 键为 `sha256(query|context)`；条目仅在 `now - inserted_at < ttl` 时有效，过期条目按未命中处理（惰性失效）。
//! 插入前若已满：先清理全部过期条目，仍满则淘汰最旧的一条，保证 `len <= max_size`。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::router::types::ClassificationResult;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: ClassificationResult,
    inserted_at: Instant,
}

/// 带 TTL 与容量上限的缓存；读并发、写独占
#[derive(Debug)]
pub struct ClassificationCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_size: usize,
}

impl ClassificationCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_size: max_size.max(1),
        }
    }

    /// 复合键
    pub fn key(query: &str, context: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hasher.update(b"|");
        hasher.update(context.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    pub async fn get(&self, key: &str) -> Option<ClassificationResult> {
        self.get_at(key, Instant::now()).await
    }

    pub async fn get_at(&self, key: &str, now: Instant) -> Option<ClassificationResult> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| now.saturating_duration_since(e.inserted_at) < self.ttl)
            .map(|e| e.result.clone())
    }

    pub async fn insert(&self, key: String, result: ClassificationResult) {
        self.insert_at(key, result, Instant::now()).await;
    }

    pub async fn insert_at(&self, key: String, result: ClassificationResult, now: Instant) {
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            let ttl = self.ttl;
            entries.retain(|_, e| now.saturating_duration_since(e.inserted_at) < ttl);

            if entries.len() >= self.max_size {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(k) = oldest {
                    entries.remove(&k);
                }
            }
        }

        entries.insert(key, CacheEntry { result, inserted_at: now });
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::types::RequestType;

    fn result(request_type: RequestType) -> ClassificationResult {
        ClassificationResult {
            request_type,
            ..Default::default()
        }
    }

    #[test]
    fn test_key_is_stable_per_query_and_context() {
        assert_eq!(ClassificationCache::key("q", "ctx"), ClassificationCache::key("q", "ctx"));
        assert_ne!(ClassificationCache::key("q", "ctx1"), ClassificationCache::key("q", "ctx2"));
        assert_eq!(ClassificationCache::key("q", "ctx").len(), 64);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = ClassificationCache::new(Duration::from_secs(300), 10);
        let t0 = Instant::now();
        cache.insert_at("k".into(), result(RequestType::WebSearch), t0).await;

        assert!(cache.get_at("k", t0 + Duration::from_secs(299)).await.is_some());
        assert!(cache.get_at("k", t0 + Duration::from_secs(300)).await.is_none());
    }

    #[tokio::test]
    async fn test_full_cache_evicts_expired_before_fresh() {
        let cache = ClassificationCache::new(Duration::from_secs(300), 2);
        let t0 = Instant::now();
        cache.insert_at("old".into(), result(RequestType::Consultation), t0).await;
        cache
            .insert_at("fresh".into(), result(RequestType::WebSearch), t0 + Duration::from_secs(200))
            .await;

        let t1 = t0 + Duration::from_secs(350);
        cache.insert_at("new".into(), result(RequestType::DataExport), t1).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get_at("old", t1).await.is_none());
        assert!(cache.get_at("fresh", t1).await.is_some());
        assert!(cache.get_at("new", t1).await.is_some());
    }

    #[tokio::test]
    async fn test_full_cache_evicts_oldest_when_nothing_expired() {
        let cache = ClassificationCache::new(Duration::from_secs(300), 2);
        let t0 = Instant::now();
        cache.insert_at("a".into(), result(RequestType::Consultation), t0).await;
        cache.insert_at("b".into(), result(RequestType::WebSearch), t0 + Duration::from_secs(1)).await;
        cache.insert_at("c".into(), result(RequestType::DataExport), t0 + Duration::from_secs(2)).await;

        let now = t0 + Duration::from_secs(3);
        assert!(cache.get_at("a", now).await.is_none());
        assert!(cache.get_at("b", now).await.is_some());
        assert!(cache.get_at("c", now).await.is_some());
    }

    #[tokio::test]
    async fn test_size_bound_holds_for_every_insert() {
        let cache = ClassificationCache::new(Duration::from_secs(300), 3);
        let t0 = Instant::now();
        for i in 0..20u64 {
            cache
                .insert_at(format!("k{}", i), result(RequestType::DataAnalysis), t0 + Duration::from_secs(i * 40))
                .await;
            assert!(cache.len().await <= 3);
        }
    }
}
