//! 状态存储
//!
//! 模块之间共享的键值状态，分为全局作用域和模块私有作用域。
//!
//! - 全局状态的变更会通知按键模式（正则，整键匹配）订阅的监听器
//! - `query` 按键模式、所有者、时间范围、访问次数和元数据过滤全局状态
//! - `transaction` 在闭包返回错误时回滚全局状态
//! - 全局状态可以持久化为 JSON 文件

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::utils::{generate_id, Result};

/// 状态条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    pub owner: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub access_count: u64,
}

impl StateEntry {
    pub fn new(value: Value, owner: impl Into<String>) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
            owner: owner.into(),
            metadata: HashMap::new(),
            access_count: 0,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 全局状态变更
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub key: String,
    pub old_value: Option<Value>,
    /// `None` 表示被移除
    pub new_value: Option<Value>,
    pub modifier: String,
}

impl StateChange {
    pub fn is_removal(&self) -> bool {
        self.new_value.is_none()
    }
}

/// 状态变更回调
pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

struct Subscription {
    id: String,
    pattern: Regex,
    callback: StateListener,
}

// ==================== 查询 ====================

/// 状态查询条件，所有条件同时满足
#[derive(Debug, Clone, Default)]
pub struct StateQuery {
    key_pattern: Option<Regex>,
    owner: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    min_access_count: Option<u64>,
    metadata: HashMap<String, Value>,
}

impl StateQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// 键模式（整键匹配）
    pub fn with_key_pattern(mut self, pattern: &str) -> Result<Self> {
        self.key_pattern = Some(full_match(pattern)?);
        Ok(self)
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_time_range(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn with_min_access_count(mut self, count: u64) -> Self {
        self.min_access_count = Some(count);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    fn matches(&self, key: &str, entry: &StateEntry) -> bool {
        self.key_pattern.as_ref().map_or(true, |p| p.is_match(key))
            && self.owner.as_ref().map_or(true, |o| *o == entry.owner)
            && self.since.map_or(true, |t| entry.timestamp >= t)
            && self.until.map_or(true, |t| entry.timestamp <= t)
            && self.min_access_count.map_or(true, |c| entry.access_count >= c)
            && self
                .metadata
                .iter()
                .all(|(k, v)| entry.metadata.get(k) == Some(v))
    }
}

fn full_match(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{})$", pattern))?)
}

// ==================== 存储 ====================

/// 状态存储
#[derive(Default)]
pub struct StateStore {
    global: RwLock<HashMap<String, StateEntry>>,
    modules: RwLock<HashMap<String, HashMap<String, StateEntry>>>,
    listeners: RwLock<Vec<Subscription>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== 全局作用域 ====================

    /// 设置全局状态，返回旧值
    pub fn set_global(&self, key: impl Into<String>, value: Value, setter: &str) -> Option<Value> {
        self.set_global_entry(key, StateEntry::new(value, setter))
    }

    /// 以完整条目设置全局状态
    pub fn set_global_entry(&self, key: impl Into<String>, entry: StateEntry) -> Option<Value> {
        let key = key.into();
        let new_value = entry.value.clone();
        let modifier = entry.owner.clone();
        let old = self
            .global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), entry)
            .map(|e| e.value);

        self.notify(StateChange {
            key,
            old_value: old.clone(),
            new_value: Some(new_value),
            modifier,
        });
        old
    }

    /// 读取全局状态，访问计数加一
    pub fn get_global(&self, key: &str) -> Option<Value> {
        let mut global = self.global.write().unwrap_or_else(PoisonError::into_inner);
        global.get_mut(key).map(|entry| {
            entry.access_count += 1;
            entry.value.clone()
        })
    }

    /// 读取完整条目（不计访问）
    pub fn global_entry(&self, key: &str) -> Option<StateEntry> {
        self.global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn has_global(&self, key: &str) -> bool {
        self.global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// 移除全局状态
    pub fn remove_global(&self, key: &str, remover: &str) -> Option<Value> {
        let removed = self
            .global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|e| e.value);

        if let Some(old) = &removed {
            self.notify(StateChange {
                key: key.to_string(),
                old_value: Some(old.clone()),
                new_value: None,
                modifier: remover.to_string(),
            });
        }
        removed
    }

    /// 批量设置
    pub fn batch_set(&self, states: impl IntoIterator<Item = (String, Value)>, setter: &str) {
        for (key, value) in states {
            self.set_global(key, value, setter);
        }
    }

    /// 查询全局状态
    pub fn query(&self, query: &StateQuery) -> BTreeMap<String, Value> {
        self.global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, entry)| query.matches(key, entry))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// 事务：闭包返回错误时全局状态回滚到执行前
    ///
    /// 回滚不会触发监听器。
    pub fn transaction<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&StateStore) -> Result<T>,
    {
        let backup = self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match operation(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                *self.global.write().unwrap_or_else(PoisonError::into_inner) = backup;
                debug!(error = %e, "状态事务已回滚");
                Err(e)
            }
        }
    }

    // ==================== 模块作用域 ====================

    pub fn set_module(&self, module: &str, key: impl Into<String>, value: Value) -> Option<Value> {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(module.to_string())
            .or_default()
            .insert(key.into(), StateEntry::new(value, module))
            .map(|e| e.value)
    }

    pub fn get_module(&self, module: &str, key: &str) -> Option<Value> {
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        modules.get_mut(module)?.get_mut(key).map(|entry| {
            entry.access_count += 1;
            entry.value.clone()
        })
    }

    pub fn has_module(&self, module: &str, key: &str) -> bool {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .is_some_and(|m| m.contains_key(key))
    }

    pub fn remove_module(&self, module: &str, key: &str) -> Option<Value> {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(module)?
            .remove(key)
            .map(|e| e.value)
    }

    /// 清除模块的全部私有状态
    pub fn clear_module(&self, module: &str) -> usize {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(module)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    // ==================== 监听 ====================

    /// 订阅键模式，返回订阅 ID
    pub fn subscribe<F>(&self, key_pattern: &str, callback: F) -> Result<String>
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = generate_id();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id: id.clone(),
                pattern: full_match(key_pattern)?,
                callback: Arc::new(callback),
            });
        Ok(id)
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|s| s.id != subscription_id);
        listeners.len() != before
    }

    fn notify(&self, change: StateChange) {
        let callbacks: Vec<StateListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.pattern.is_match(&change.key))
            .map(|s| Arc::clone(&s.callback))
            .collect();

        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&change)));
            if result.is_err() {
                warn!(key = %change.key, "状态监听器 panic");
            }
        }
    }

    // ==================== 持久化 ====================

    /// 保存全局状态
    pub async fn save_to_file(&self, path: &Path) -> Result<usize> {
        let snapshot: BTreeMap<String, StateEntry> = self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(&snapshot)?).await?;
        debug!(path = ?path, count = snapshot.len(), "全局状态已保存");
        Ok(snapshot.len())
    }

    /// 加载全局状态，已有同名键会被覆盖，不触发监听器
    pub async fn load_from_file(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let content = tokio::fs::read(path).await?;
        let entries: HashMap<String, StateEntry> = serde_json::from_slice(&content)?;
        let count = entries.len();
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(entries);
        debug!(path = ?path, count, "全局状态已加载");
        Ok(count)
    }

    pub fn global_len(&self) -> usize {
        self.global.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("global", &self.global_len())
            .finish()
    }
}
