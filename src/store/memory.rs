use super::{RateLimitStore, ScriptId};
use crate::error::DecisionError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One bucket's worth of mutable state, behind its own lock so concurrent
/// decisions on different keys never contend. Mirrors the fast-path
/// `get`/slow-path `entry().or_insert_with()` idiom used for per-key state
/// elsewhere in this codebase.
struct Bucket {
    inner: Mutex<BucketInner>,
}

#[derive(Default)]
struct BucketInner {
    // token bucket / leaky bucket
    level: f64,
    last_ms: i64,
    // sliding window log: id -> score (ms)
    log: BTreeMap<String, i64>,
    // fixed window / sliding window counter: the counter for this exact
    // windowed key. The window boundary is already encoded in the bucket's
    // string key (e.g. `ratelimit:fixed:k:<window_start>`), so one scalar
    // per bucket is enough — no need to index by window_start again here.
    count: i64,
    initialized: bool,
}

/// In-process double for `RateLimitStore` that reproduces each script's
/// semantics natively, under a per-key async mutex so the atomicity
/// invariants the real Redis scripts provide still hold here. Doubles as a
/// zero-dependency local/dev store when no Redis URL is configured.
#[derive(Clone, Default)]
pub struct MemoryStore {
    buckets: Arc<DashMap<String, Arc<Bucket>>>,
    hashes: Arc<DashMap<String, Vec<(String, String)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, key: &str) -> Arc<Bucket> {
        if let Some(b) = self.buckets.get(key) {
            return b.clone();
        }
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Bucket {
                    inner: Mutex::new(BucketInner::default()),
                })
            })
            .clone()
    }

    fn arg_f64(args: &[String], idx: usize) -> Result<f64, DecisionError> {
        args.get(idx)
            .ok_or_else(|| DecisionError::StoreScript(format!("missing arg {idx}")))?
            .parse::<f64>()
            .map_err(|e| DecisionError::StoreScript(e.to_string()))
    }

    fn arg_i64(args: &[String], idx: usize) -> Result<i64, DecisionError> {
        args.get(idx)
            .ok_or_else(|| DecisionError::StoreScript(format!("missing arg {idx}")))?
            .parse::<i64>()
            .map_err(|e| DecisionError::StoreScript(e.to_string()))
    }

    fn arg_str<'a>(args: &'a [String], idx: usize) -> Result<&'a str, DecisionError> {
        args.get(idx)
            .map(|s| s.as_str())
            .ok_or_else(|| DecisionError::StoreScript(format!("missing arg {idx}")))
    }
}

fn int(v: i64) -> redis::Value {
    redis::Value::Int(v)
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn exec_script(
        &self,
        script: ScriptId,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<redis::Value>, DecisionError> {
        match script {
            ScriptId::TokenBucket => {
                let key = keys.first().ok_or_else(|| DecisionError::StoreScript("missing key".into()))?;
                let capacity = Self::arg_f64(args, 0)?;
                let rate = Self::arg_f64(args, 1)?;
                let now = Self::arg_i64(args, 2)?;
                let requested = Self::arg_f64(args, 3)?;

                let bucket = self.bucket(key);
                let mut state = bucket.inner.lock().await;
                if !state.initialized {
                    state.level = capacity;
                    state.last_ms = now;
                    state.initialized = true;
                }
                let elapsed = ((now - state.last_ms).max(0) as f64) / 1000.0;
                state.level = (state.level + elapsed * rate).min(capacity);
                state.last_ms = now;

                if state.level >= requested {
                    state.level -= requested;
                    Ok(vec![int(1), int(state.level.floor() as i64), int(0)])
                } else {
                    let deficit = requested - state.level;
                    let retry_after_ms = if rate > 0.0 {
                        (deficit / rate * 1000.0).ceil() as i64
                    } else {
                        i64::MAX
                    };
                    Ok(vec![int(0), int(state.level.floor() as i64), int(retry_after_ms)])
                }
            }

            ScriptId::SlidingWindowLog => {
                let key = keys.first().ok_or_else(|| DecisionError::StoreScript("missing key".into()))?;
                let capacity = Self::arg_i64(args, 0)?;
                let window = Self::arg_i64(args, 1)?;
                let now = Self::arg_i64(args, 2)?;
                let requested = Self::arg_i64(args, 3)?;
                let id_prefix = Self::arg_str(args, 4)?.to_string();

                let bucket = self.bucket(key);
                let mut state = bucket.inner.lock().await;
                let cutoff = now - window;
                state.log.retain(|_, score| *score > cutoff);
                let n = state.log.len() as i64;
                let oldest = state.log.values().min().copied().unwrap_or(0);

                if n + requested <= capacity {
                    for i in 0..requested {
                        state.log.insert(format!("{id_prefix}:{i}"), now);
                    }
                    Ok(vec![int(1), int(capacity - n - requested), int(oldest)])
                } else {
                    Ok(vec![int(0), int((capacity - n).max(0)), int(oldest)])
                }
            }

            ScriptId::SlidingWindowCounter => {
                // KEYS[0] and KEYS[1] are distinct string keys — one per window
                // boundary — exactly like two separate Redis keys. The previous
                // window's count lives in *its own* bucket, not the current one.
                let cur_key = keys.first().ok_or_else(|| DecisionError::StoreScript("missing cur key".into()))?;
                let prev_key = keys.get(1).ok_or_else(|| DecisionError::StoreScript("missing prev key".into()))?;
                let capacity = Self::arg_i64(args, 0)?;
                let window = Self::arg_i64(args, 1)?;
                let now = Self::arg_i64(args, 2)?;
                let requested = Self::arg_i64(args, 3)?;
                let window_start = Self::arg_i64(args, 4)?;

                let cur_bucket = self.bucket(cur_key);
                let prev_bucket = self.bucket(prev_key);
                let mut cur_state = cur_bucket.inner.lock().await;
                let prev_count = prev_bucket.inner.lock().await.count;
                let cur = cur_state.count;

                let elapsed = (now - window_start) as f64;
                let mut prev_weight = (window as f64 - elapsed) / window as f64;
                prev_weight = prev_weight.clamp(0.0, 1.0);
                let weighted = prev_count as f64 * prev_weight + cur as f64;

                if weighted + requested as f64 <= capacity as f64 {
                    cur_state.count += requested;
                    let new_cur = cur_state.count;
                    Ok(vec![
                        int(1),
                        int(((weighted + requested as f64) * 1000.0).floor() as i64),
                        int(new_cur),
                    ])
                } else {
                    Ok(vec![int(0), int((weighted * 1000.0).floor() as i64), int(cur)])
                }
            }

            ScriptId::FixedWindow => {
                let key = keys.first().ok_or_else(|| DecisionError::StoreScript("missing key".into()))?;
                let capacity = Self::arg_i64(args, 0)?;
                let requested = Self::arg_i64(args, 1)?;

                let bucket = self.bucket(key);
                let mut state = bucket.inner.lock().await;
                state.count += requested;
                let new_count = state.count;

                if new_count <= capacity {
                    Ok(vec![int(1), int(capacity - new_count), int(new_count)])
                } else {
                    Ok(vec![
                        int(0),
                        int((capacity - new_count + requested).max(0)),
                        int(new_count),
                    ])
                }
            }

            ScriptId::LeakyBucket => {
                let key = keys.first().ok_or_else(|| DecisionError::StoreScript("missing key".into()))?;
                let capacity = Self::arg_f64(args, 0)?;
                let rate = Self::arg_f64(args, 1)?;
                let now = Self::arg_i64(args, 2)?;
                let requested = Self::arg_f64(args, 3)?;

                let bucket = self.bucket(key);
                let mut state = bucket.inner.lock().await;
                if !state.initialized {
                    state.level = 0.0;
                    state.last_ms = now;
                    state.initialized = true;
                }
                let elapsed = ((now - state.last_ms).max(0) as f64) / 1000.0;
                state.level = (state.level - elapsed * rate).max(0.0);
                state.last_ms = now;

                if state.level + requested <= capacity {
                    state.level += requested;
                    let wait_ms = if rate > 0.0 {
                        (state.level / rate * 1000.0).ceil() as i64
                    } else {
                        0
                    };
                    Ok(vec![int(1), int((state.level * 1000.0).floor() as i64), int(wait_ms)])
                } else {
                    let overflow = state.level + requested - capacity;
                    let retry_after_ms = if rate > 0.0 {
                        (overflow / rate * 1000.0).ceil() as i64
                    } else {
                        1000
                    };
                    Ok(vec![
                        int(0),
                        int((state.level * 1000.0).floor() as i64),
                        int(retry_after_ms),
                    ])
                }
            }
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, DecisionError> {
        let from_hashes = self
            .hashes
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone());
        let from_buckets = self
            .buckets
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone());
        Ok(from_hashes.chain(from_buckets).collect())
    }

    async fn get_hash(&self, key: &str) -> Result<Option<Vec<(String, String)>>, DecisionError> {
        Ok(self.hashes.get(key).map(|v| v.clone()))
    }

    async fn set_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        _ttl: Duration,
    ) -> Result<(), DecisionError> {
        self.hashes.insert(key.to_string(), fields.to_vec());
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), DecisionError> {
        for k in keys {
            self.buckets.remove(k);
            self.hashes.remove(k);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, DecisionError> {
        Ok(Duration::from_micros(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_script_allows_burst_then_denies() {
        let store = MemoryStore::new();
        let keys = vec!["ratelimit:bucket:k".to_string()];
        let args = |now: i64, req: f64| {
            vec!["10".to_string(), "1".to_string(), now.to_string(), req.to_string()]
        };

        for i in 0..10 {
            let reply = store
                .exec_script(ScriptId::TokenBucket, &keys, &args(0, 1.0))
                .await
                .unwrap();
            assert_eq!(reply[0], int(1), "request {i} should be allowed");
        }

        let reply = store
            .exec_script(ScriptId::TokenBucket, &keys, &args(0, 1.0))
            .await
            .unwrap();
        assert_eq!(reply[0], int(0));
    }

    #[tokio::test]
    async fn fixed_window_script_resets_implicitly_via_new_key() {
        let store = MemoryStore::new();
        let keys_w1 = vec!["ratelimit:fixed:k:0".to_string()];
        let keys_w2 = vec!["ratelimit:fixed:k:10".to_string()];
        let args = vec!["4".to_string(), "1".to_string(), "10".to_string()];

        for _ in 0..4 {
            let reply = store.exec_script(ScriptId::FixedWindow, &keys_w1, &args).await.unwrap();
            assert_eq!(reply[0], int(1));
        }
        let reply = store.exec_script(ScriptId::FixedWindow, &keys_w1, &args).await.unwrap();
        assert_eq!(reply[0], int(0));

        let reply = store.exec_script(ScriptId::FixedWindow, &keys_w2, &args).await.unwrap();
        assert_eq!(reply[0], int(1));
    }
}
