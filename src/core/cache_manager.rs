//! CacheManager: prompt-prefix fingerprinting and accounting, plus the
//! at-most-one-concurrent-generation guard (§4.5). Fingerprinting uses
//! `blake3`, the same approach as the pack's `prefix-cache` crate; eviction
//! uses `lru`, bounded by both entry count and total retained tokens.

use std::collections::HashMap;
use std::sync::Arc;

use candle_transformers::models::llama::Cache;
use lru::LruCache;
use tokio::sync::{Notify, Semaphore};

use crate::error::AppError;

/// Everything that affects the KV cache's content, in the order it was
/// processed — used to compute the fingerprint. Sampling parameters that
/// don't affect prefill (temperature, seed, max_tokens, stop) are excluded.
pub struct FingerprintInput<'a> {
    pub model_id: &'a str,
    pub system_prompt: Option<&'a str>,
    pub messages: &'a [(String, String)],
    pub tool_schema: Option<&'a str>,
    pub response_format: Option<&'a str>,
}

pub fn fingerprint(input: &FingerprintInput<'_>) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"\x00model\x00");
    hasher.update(input.model_id.as_bytes());
    if let Some(sys) = input.system_prompt {
        hasher.update(b"\x00sys\x00");
        hasher.update(sys.as_bytes());
    }
    for (role, content) in input.messages {
        hasher.update(b"\x00msg\x00");
        hasher.update(role.as_bytes());
        hasher.update(b"\x00");
        hasher.update(content.as_bytes());
    }
    if let Some(tools) = input.tool_schema {
        hasher.update(b"\x00tools\x00");
        hasher.update(tools.as_bytes());
    }
    if let Some(rf) = input.response_format {
        hasher.update(b"\x00rf\x00");
        hasher.update(rf.as_bytes());
    }
    hasher.finalize()
}

pub struct PrefixSnapshot {
    pub cache: Cache,
    /// Tokens reused without re-running the forward pass — i.e. the count
    /// the request's `cached_tokens` field reports on a hit (§9 Open
    /// Question 1: defined here as "tokens skipped", never the position that
    /// itself produced the cached state).
    pub token_count: usize,
}

pub struct CacheManager {
    table: std::sync::Mutex<LruCache<blake3::Hash, Arc<PrefixSnapshot>>>,
    inflight: std::sync::Mutex<HashMap<blake3::Hash, Arc<Notify>>>,
    max_retained_tokens: usize,
    retained_tokens: std::sync::atomic::AtomicUsize,
    generation_slot: Semaphore,
    queue_depth: std::sync::atomic::AtomicUsize,
    max_queue_depth: usize,
}

impl CacheManager {
    pub fn new(max_entries: usize, max_retained_tokens: usize, generation_slots: usize, max_queue_depth: usize) -> Self {
        Self {
            table: std::sync::Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(max_entries.max(1)).unwrap(),
            )),
            inflight: std::sync::Mutex::new(HashMap::new()),
            max_retained_tokens,
            retained_tokens: std::sync::atomic::AtomicUsize::new(0),
            generation_slot: Semaphore::new(generation_slots.max(1)),
            queue_depth: std::sync::atomic::AtomicUsize::new(0),
            max_queue_depth,
        }
    }

    /// Looks up a fingerprint's cached snapshot without blocking. Returns
    /// `None` on a miss; the caller reports `cached_tokens = 0` in that case.
    pub fn lookup(&self, fp: &blake3::Hash) -> Option<Arc<PrefixSnapshot>> {
        self.table.lock().unwrap().get(fp).cloned()
    }

    /// Registers this request as the one performing the (first) prefill for
    /// `fp`. Returns `None` if another request is already prefilling it —
    /// the caller should `wait_for_inflight` instead. Call `finish_inflight`
    /// once the snapshot has been inserted (or generation failed).
    pub fn begin_inflight(&self, fp: blake3::Hash) -> Option<Arc<Notify>> {
        let mut inflight = self.inflight.lock().unwrap();
        if inflight.contains_key(&fp) {
            return None;
        }
        let notify = Arc::new(Notify::new());
        inflight.insert(fp, Arc::clone(&notify));
        Some(notify)
    }

    pub fn inflight_handle(&self, fp: &blake3::Hash) -> Option<Arc<Notify>> {
        self.inflight.lock().unwrap().get(fp).cloned()
    }

    pub fn finish_inflight(&self, fp: &blake3::Hash) {
        if let Some(notify) = self.inflight.lock().unwrap().remove(fp) {
            notify.notify_waiters();
        }
    }

    pub fn insert(&self, fp: blake3::Hash, snapshot: Arc<PrefixSnapshot>) {
        let mut table = self.table.lock().unwrap();
        self.retained_tokens
            .fetch_add(snapshot.token_count, std::sync::atomic::Ordering::Relaxed);
        if let Some(evicted) = table.push(fp, snapshot).map(|(_, v)| v) {
            self.retained_tokens
                .fetch_sub(evicted.token_count, std::sync::atomic::Ordering::Relaxed);
        }
        while self.retained_tokens.load(std::sync::atomic::Ordering::Relaxed) > self.max_retained_tokens {
            let Some((_, evicted)) = table.pop_lru() else {
                break;
            };
            self.retained_tokens
                .fetch_sub(evicted.token_count, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Queues for, then acquires, the single generation slot (§4.5, §5).
    /// Returns `QueueFull` immediately if the queue is already at capacity —
    /// it does not wait for room to free up.
    pub async fn acquire_slot(&self) -> Result<tokio::sync::SemaphorePermit<'_>, AppError> {
        let depth = self
            .queue_depth
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if depth > self.max_queue_depth {
            self.queue_depth
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            return Err(AppError::QueueFull);
        }
        let permit = self.generation_slot.acquire().await.map_err(|_| {
            AppError::Internal("generation slot semaphore closed unexpectedly".to_string())
        });
        self.queue_depth
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        permit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_identical_input() {
        let messages = vec![("user".to_string(), "hi".to_string())];
        let a = FingerprintInput {
            model_id: "m",
            system_prompt: Some("sys"),
            messages: &messages,
            tool_schema: None,
            response_format: None,
        };
        let b = FingerprintInput {
            model_id: "m",
            system_prompt: Some("sys"),
            messages: &messages,
            tool_schema: None,
            response_format: None,
        };
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_with_message_content() {
        let m1 = vec![("user".to_string(), "hi".to_string())];
        let m2 = vec![("user".to_string(), "bye".to_string())];
        let a = FingerprintInput {
            model_id: "m",
            system_prompt: None,
            messages: &m1,
            tool_schema: None,
            response_format: None,
        };
        let b = FingerprintInput {
            model_id: "m",
            system_prompt: None,
            messages: &m2,
            tool_schema: None,
            response_format: None,
        };
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[tokio::test]
    async fn begin_inflight_rejects_second_concurrent_prefill() {
        let mgr = CacheManager::new(8, 1_000_000, 1, 8);
        let fp = blake3::hash(b"x");
        let first = mgr.begin_inflight(fp);
        assert!(first.is_some());
        let second = mgr.begin_inflight(fp);
        assert!(second.is_none());
        mgr.finish_inflight(&fp);
        let third = mgr.begin_inflight(fp);
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn queue_full_is_reported_once_depth_exceeds_max() {
        let mgr = CacheManager::new(8, 1_000_000, 1, 1);
        let permit = mgr.acquire_slot().await.unwrap();
        // A second concurrent acquire attempt would queue; simulate queue
        // depth already at capacity by checking the accounting directly via
        // a timeout-free path: spawn and abort.
        let mgr = Arc::new(mgr);
        let mgr2 = Arc::clone(&mgr);
        let handle = tokio::spawn(async move { mgr2.acquire_slot().await });
        tokio::task::yield_now().await;
        drop(permit);
        let res = tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("task should finish once the slot is released")
            .unwrap();
        assert!(res.is_ok());
    }
}
