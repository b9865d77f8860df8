//! 函数结果缓存
//!
//! 只缓存签名带 `cacheable: true` 属性的函数。键由模块名、版本、函数名和规范化后的参数组成，
//! 条目在容量满时按 LRU 淘汰，超过 TTL 后视为未命中。

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;

use crate::module::metadata::{FunctionParams, FunctionResult};
use crate::module::version::ModuleVersion;

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    module: String,
    version: String,
    function: String,
    params: String,
}

impl CacheKey {
    /// 参数按键排序后序列化，键顺序不同的同一组参数得到相同的键
    pub fn new(module: &str, version: &ModuleVersion, function: &str, params: &FunctionParams) -> Self {
        let ordered: BTreeMap<&String, &serde_json::Value> = params.iter().collect();
        Self {
            module: module.to_string(),
            version: version.to_string(),
            function: function.to_string(),
            params: serde_json::to_string(&ordered).unwrap_or_default(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }
}

struct CachedResult {
    result: FunctionResult,
    stored_at: Instant,
}

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
    /// 命中率（百分比）
    pub hit_rate: f64,
}

/// 函数结果缓存
pub struct FunctionCache {
    cache: Mutex<LruCache<CacheKey, CachedResult>>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FunctionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<FunctionResult> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => Some(entry.result.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        };

        match fresh {
            Some(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: CacheKey, result: FunctionResult) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(
                key,
                CachedResult {
                    result,
                    stored_at: Instant::now(),
                },
            );
    }

    /// 使模块的全部条目失效，返回移除数量
    pub fn invalidate_module(&self, module: &str) -> usize {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(key, _)| key.module == module)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            cache.pop(key);
        }
        stale.len()
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self.len(),
            capacity: self.capacity,
            hit_rate: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}

impl std::fmt::Debug for FunctionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionCache")
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}
