//! 沙箱执行器
//!
//! 每次调用创建一个 [`SandboxContext`]，模块代码的所有敏感操作都通过它检查。
//! 每次检查都会先核对已用时间，超时后上下文被标记为终止，之后的检查全部失败。
//!
//! 取消是协作式的：只有回到运行时的检查点才能发现超时。
//! 执行任务放在每次调用独立的 [`TaskGroup`] 中，调用结束或超时后中止组内全部任务；
//! 不在 `.await` 点让出的同步代码无法被抢占，这是已知限制。

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::sandbox::config::{SandboxConfig, SandboxPolicy};
use crate::utils::{generate_uuid, CjmodError, Result};

/// 实现保留的系统属性命名空间，始终可读
pub const RESERVED_PROPERTY_PREFIX: &str = "cjmod.";

/// 始终可访问的符号命名空间
const BUILTIN_NAMESPACES: [&str; 2] = ["core", "cjmod"];

/// 文件访问方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
    Delete,
}

impl FileAccess {
    fn as_str(&self) -> &'static str {
        match self {
            FileAccess::Read => "read",
            FileAccess::Write => "write",
            FileAccess::Delete => "delete",
        }
    }
}

// ==================== 沙箱上下文 ====================

/// 单次调用的沙箱上下文
#[derive(Debug)]
pub struct SandboxContext {
    id: String,
    module: String,
    config: Arc<SandboxConfig>,
    started: Instant,
    threads: AtomicUsize,
    memory: AtomicU64,
    terminated: AtomicBool,
    system_properties: Arc<HashMap<String, String>>,
}

impl SandboxContext {
    /// 创建上下文，计时从此刻开始
    pub fn new(
        module: impl Into<String>,
        config: Arc<SandboxConfig>,
        system_properties: Arc<HashMap<String, String>>,
    ) -> Self {
        Self {
            id: generate_uuid(),
            module: module.into(),
            config,
            started: Instant::now(),
            threads: AtomicUsize::new(0),
            memory: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            system_properties,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// 剩余时间预算
    pub fn remaining(&self) -> Duration {
        self.config.max_cpu_time().saturating_sub(self.elapsed())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            debug!(module = %self.module, context = %self.id, "沙箱上下文已终止");
        }
    }

    /// 当前存活的任务数
    pub fn thread_count(&self) -> usize {
        self.threads.load(Ordering::Acquire)
    }

    /// 已登记的内存用量
    pub fn memory_used(&self) -> u64 {
        self.memory.load(Ordering::Acquire)
    }

    fn time_limit_error(&self) -> CjmodError {
        CjmodError::TimeLimitExceeded {
            module: self.module.clone(),
            limit_ms: self.config.max_cpu_time_ms,
        }
    }

    fn deny(&self, operation: impl Into<String>, reason: impl Into<String>) -> CjmodError {
        let operation = operation.into();
        let reason = reason.into();
        warn!(module = %self.module, operation = %operation, reason = %reason, "沙箱拒绝操作");
        CjmodError::PermissionDenied {
            module: self.module.clone(),
            operation,
            reason,
        }
    }

    /// 核对时间预算，每个检查点都会先调用
    pub fn check_time(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(self.time_limit_error());
        }
        if self.elapsed() > self.config.max_cpu_time() {
            self.terminate();
            return Err(self.time_limit_error());
        }
        Ok(())
    }

    /// 检查文件访问
    pub fn check_file_access(&self, path: &Path, access: FileAccess) -> Result<()> {
        self.check_time()?;
        let operation = format!("file {} {}", access.as_str(), path.display());

        if !self.config.allow_file_access {
            return Err(self.deny(operation, "不允许文件访问"));
        }

        let target = normalize_path(path);
        let allowed = self
            .config
            .allowed_paths
            .iter()
            .any(|prefix| target.starts_with(normalize_path(prefix)));
        if !allowed {
            return Err(self.deny(operation, "路径不在允许列表中"));
        }
        Ok(())
    }

    /// 检查网络访问，`host` 可以带端口
    pub fn check_network_access(&self, host: &str) -> Result<()> {
        self.check_time()?;
        let operation = format!("connect {}", host);

        if !self.config.allow_network_access {
            return Err(self.deny(operation, "不允许网络访问"));
        }

        let host = strip_port(host).to_lowercase();
        let allowed = self.config.allowed_hosts.iter().any(|pattern| {
            let pattern = pattern.to_lowercase();
            match pattern.strip_prefix("*.") {
                _ if pattern == "*" => true,
                Some(suffix) => host.ends_with(&format!(".{}", suffix)),
                None => pattern == host,
            }
        });
        if !allowed {
            return Err(self.deny(operation, "主机不在允许列表中"));
        }
        Ok(())
    }

    /// 检查反射
    pub fn check_reflection(&self, target: &str) -> Result<()> {
        self.check_time()?;
        if !self.config.allow_reflection {
            return Err(self.deny(format!("reflect {}", target), "不允许反射"));
        }
        Ok(())
    }

    /// 申请任务名额，许可释放时名额归还
    pub fn acquire_thread(self: &Arc<Self>) -> Result<ThreadPermit> {
        self.check_time()?;
        if !self.config.allow_thread_creation {
            return Err(self.deny("spawn", "不允许创建任务"));
        }

        let max = self.config.max_threads;
        let acquired = self
            .threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            });
        if acquired.is_err() {
            return Err(CjmodError::QuotaExceeded {
                module: self.module.clone(),
                resource: "threads".to_string(),
                limit: max as u64,
            });
        }

        Ok(ThreadPermit {
            context: Arc::clone(self),
        })
    }

    /// 读取系统属性
    ///
    /// `cjmod.` 前缀的属性始终可读，其余需要 `allow_system_properties`。
    pub fn read_system_property(&self, key: &str) -> Result<Option<String>> {
        self.check_time()?;
        if !key.starts_with(RESERVED_PROPERTY_PREFIX) && !self.config.allow_system_properties {
            return Err(self.deny(format!("property {}", key), "不允许读取系统属性"));
        }
        Ok(self.system_properties.get(key).cloned())
    }

    /// 检查符号访问
    ///
    /// 符号使用 `::` 分隔。内置命名空间、显式允许的符号和允许的命名空间下的符号可访问。
    pub fn check_symbol_access(&self, symbol: &str) -> Result<()> {
        self.check_time()?;
        let in_namespace = |ns: &str| {
            symbol == ns
                || symbol
                    .strip_prefix(ns)
                    .is_some_and(|rest| rest.starts_with("::"))
        };

        let allowed = BUILTIN_NAMESPACES.iter().any(|ns| in_namespace(ns))
            || self.config.allowed_symbols.contains(symbol)
            || self.config.allowed_packages.iter().any(|ns| in_namespace(ns));
        if !allowed {
            return Err(self.deny(format!("symbol {}", symbol), "符号不在允许列表中"));
        }
        Ok(())
    }

    /// 创建嵌套隔离边界，始终拒绝
    pub fn check_create_isolation(&self) -> Result<()> {
        self.check_time()?;
        Err(self.deny("create isolation boundary", "沙箱不支持嵌套"))
    }

    /// 退出宿主进程，始终拒绝
    pub fn check_exit(&self, code: i32) -> Result<()> {
        self.check_time()?;
        Err(self.deny(format!("exit {}", code), "不允许退出宿主进程"))
    }

    /// 登记内存用量
    pub fn charge_memory(&self, bytes: u64) -> Result<()> {
        self.check_time()?;
        let max = self.config.max_memory;
        self.memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= max)
            })
            .map(|_| ())
            .map_err(|_| CjmodError::QuotaExceeded {
                module: self.module.clone(),
                resource: "memory".to_string(),
                limit: max,
            })
    }

    /// 归还内存用量
    pub fn release_memory(&self, bytes: u64) {
        let _ = self
            .memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

/// 任务名额，释放时归还
#[derive(Debug)]
pub struct ThreadPermit {
    context: Arc<SandboxContext>,
}

impl Drop for ThreadPermit {
    fn drop(&mut self) {
        self.context.threads.fetch_sub(1, Ordering::AcqRel);
    }
}

fn strip_port(host: &str) -> &str {
    // IPv6 字面量 [::1]:8080
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// 词法规范化路径：补全为绝对路径并消去 `.` 与 `..`，不访问文件系统
fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

// ==================== 任务组 ====================

/// 模块任务组
///
/// 模块的所有执行任务都登记在这里，卸载或超时时可以一起中止。
/// 每次调用另有一个子组，中止父组时子组内的任务一并中止。
#[derive(Debug)]
pub struct TaskGroup {
    module: String,
    tasks: Mutex<Vec<AbortHandle>>,
    children: Mutex<Vec<Weak<TaskGroup>>>,
}

impl TaskGroup {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            tasks: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// 创建子任务组
    pub fn child(&self) -> Arc<TaskGroup> {
        let child = Arc::new(TaskGroup::new(self.module.clone()));
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        children.retain(|c| c.strong_count() > 0);
        children.push(Arc::downgrade(&child));
        child
    }

    fn live_children(&self) -> Vec<Arc<TaskGroup>> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// 在组内启动任务
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle.abort_handle());
        handle
    }

    /// 未结束的任务数，包含子组
    pub fn active_count(&self) -> usize {
        let own = {
            let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.iter().filter(|t| !t.is_finished()).count()
        };
        own + self
            .live_children()
            .iter()
            .map(|child| child.active_count())
            .sum::<usize>()
    }

    /// 中止组内及子组内的全部任务
    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            for task in tasks.drain(..) {
                if !task.is_finished() {
                    task.abort();
                    aborted += 1;
                }
            }
        }
        for child in self.live_children() {
            aborted += child.abort_all();
        }
        aborted
    }
}

/// 单次调用的任务范围，离开作用域时中止其中仍在运行的任务
struct InvocationScope<'a>(&'a TaskGroup);

impl Drop for InvocationScope<'_> {
    fn drop(&mut self) {
        let aborted = self.0.abort_all();
        if aborted > 0 {
            debug!(module = %self.0.module(), aborted, "调用结束，已中止遗留任务");
        }
    }
}

// ==================== 执行器 ====================

/// 沙箱执行器
#[derive(Debug)]
pub struct SandboxEnforcer {
    policy: RwLock<SandboxPolicy>,
    system_properties: Arc<HashMap<String, String>>,
    groups: Mutex<HashMap<String, Arc<TaskGroup>>>,
}

impl SandboxEnforcer {
    pub fn new(policy: SandboxPolicy, system_properties: HashMap<String, String>) -> Self {
        Self {
            policy: RwLock::new(policy),
            system_properties: Arc::new(system_properties),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// 替换策略，只影响之后创建的上下文
    pub fn set_policy(&self, policy: SandboxPolicy) {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// 模块生效的配置
    pub fn config_for(&self, module: &str) -> Arc<SandboxConfig> {
        let policy = self.policy.read().unwrap_or_else(PoisonError::into_inner);
        Arc::new(policy.config_for(module).clone())
    }

    /// 按策略为模块创建上下文
    pub fn create_context(&self, module: &str) -> Arc<SandboxContext> {
        self.create_context_with(module, self.config_for(module))
    }

    /// 以指定配置创建上下文
    pub fn create_context_with(&self, module: &str, config: Arc<SandboxConfig>) -> Arc<SandboxContext> {
        Arc::new(SandboxContext::new(
            module,
            config,
            Arc::clone(&self.system_properties),
        ))
    }

    /// 模块任务组，不存在时创建
    pub fn task_group(&self, module: &str) -> Arc<TaskGroup> {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            groups
                .entry(module.to_string())
                .or_insert_with(|| Arc::new(TaskGroup::new(module))),
        )
    }

    /// 为一次调用创建任务组，挂在模块任务组之下
    pub fn invocation_group(&self, module: &str) -> Arc<TaskGroup> {
        self.task_group(module).child()
    }

    /// 中止并移除模块任务组
    pub fn abort_module(&self, module: &str) -> usize {
        let group = self
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(module);
        match group {
            Some(group) => {
                let aborted = group.abort_all();
                if aborted > 0 {
                    debug!(module = %module, aborted, "已中止模块任务");
                }
                aborted
            }
            None => 0,
        }
    }

    /// 在当前任务内执行，超时即返回 `TimeLimitExceeded`
    pub async fn run<F, T>(&self, context: &SandboxContext, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        context.check_time()?;
        match tokio::time::timeout(context.remaining(), future).await {
            Ok(result) => result,
            Err(_) => {
                context.terminate();
                warn!(module = %context.module(), limit_ms = context.config().max_cpu_time_ms, "执行超时");
                Err(context.time_limit_error())
            }
        }
    }

    /// 在调用任务组中执行
    ///
    /// 调用结束或超时后，组内由模块派生的任务全部中止，不会比本次调用存活得更久。
    pub async fn run_isolated<F, T>(
        &self,
        context: &Arc<SandboxContext>,
        scope: &TaskGroup,
        future: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        context.check_time()?;
        let _scope = InvocationScope(scope);
        let mut handle = scope.spawn(future);

        match tokio::time::timeout(context.remaining(), &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_cancelled() => Err(CjmodError::Cancelled),
            Ok(Err(join_error)) => Err(CjmodError::Internal(format!(
                "模块 '{}' 的执行任务异常终止: {}",
                context.module(),
                join_error
            ))),
            Err(_) => {
                context.terminate();
                handle.abort();
                warn!(module = %context.module(), limit_ms = context.config().max_cpu_time_ms, "执行超时，任务已中止");
                Err(context.time_limit_error())
            }
        }
    }
}

impl Default for SandboxEnforcer {
    fn default() -> Self {
        Self::new(SandboxPolicy::default(), HashMap::new())
    }
}
