//! 故障处理器
//!
//! 记录故障、维护统计、通知监听器、按类别调度恢复策略，
//! 并在致命或无法恢复时通过 [`ModuleController`] 强制卸载模块。
//!
//! 处理有两种入口：
//!
//! - [`FaultHandler::log_error`]：记录后入队，由后台任务异步处理
//! - [`FaultHandler::report`]：记录后立即在当前任务中处理，并返回处理结果

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{ErrorCategory, ErrorInfo, ErrorLevel, ErrorStatistics, ModuleFault};
use crate::core::config::FaultConfig;
use crate::utils::error::Result;

// ==================== 协作接口 ====================

/// 故障处理器对模块生命周期的控制接口
///
/// 由生命周期管理器实现，故障处理器只持有弱引用。
#[async_trait]
pub trait ModuleController: Send + Sync {
    /// 重新加载模块
    async fn reload_module(&self, module: &str) -> Result<()>;

    /// 卸载模块（级联卸载依赖方）
    async fn unload_module(&self, module: &str) -> Result<()>;

    /// 释放模块持有的可重建资源（缓存等）
    async fn release_resources(&self, module: &str) -> Result<()>;
}

/// 恢复策略
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// 尝试恢复，返回是否成功
    async fn recover(
        &self,
        error: &ErrorInfo,
        controller: Option<Arc<dyn ModuleController>>,
    ) -> Result<bool>;

    /// 策略描述
    fn description(&self) -> &str;
}

/// 故障监听器
///
/// 所有方法都有空的默认实现。监听器中的 panic 会被捕获，不影响故障处理。
pub trait FaultListener: Send + Sync {
    /// 每条故障处理开始时调用
    fn on_error(&self, _error: &ErrorInfo) {}

    /// 恢复成功时调用
    fn on_recovery(&self, _error: &ErrorInfo, _strategy: &str) {}

    /// 致命故障时调用
    fn on_fatal_error(&self, _error: &ErrorInfo) {}
}

/// 单条故障的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// 某个策略恢复成功
    Recovered {
        /// 成功的策略描述
        strategy: String,
    },
    /// 没有策略或未恢复，模块保持原状
    Unrecovered,
    /// 模块已被卸载
    Unloaded,
}

/// 全局故障统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStatistics {
    /// 故障总数
    pub total_errors: u64,
    /// 成功恢复数
    pub recovered_errors: u64,
    /// 恢复率
    pub recovery_rate: f64,
    /// 出现过故障的模块数
    pub module_count: usize,
    /// 故障最多的模块（最多 10 个）
    pub top_error_modules: Vec<String>,
}

// ==================== 默认恢复策略 ====================

/// 重新加载模块（用于初始化故障）
///
/// 每个模块的连续尝试次数有上限，成功后清零。
pub struct ReloadModuleStrategy {
    max_attempts: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ReloadModuleStrategy {
    /// 创建策略
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for ReloadModuleStrategy {
    async fn recover(
        &self,
        error: &ErrorInfo,
        controller: Option<Arc<dyn ModuleController>>,
    ) -> Result<bool> {
        let Some(controller) = controller else {
            return Ok(false);
        };

        {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            let count = attempts.entry(error.module.clone()).or_insert(0);
            if *count >= self.max_attempts {
                warn!(module = %error.module, attempts = *count, "已达到最大重载次数，放弃重载");
                return Ok(false);
            }
            *count += 1;
        }

        match controller.reload_module(&error.module).await {
            Ok(()) => {
                self.attempts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&error.module);
                Ok(true)
            }
            Err(e) => {
                debug!(module = %error.module, error = %e, "重载模块失败");
                Ok(false)
            }
        }
    }

    fn description(&self) -> &str {
        "重新加载模块"
    }
}

/// 释放资源后重试（用于资源故障）
pub struct ReleaseResourcesStrategy;

#[async_trait]
impl RecoveryStrategy for ReleaseResourcesStrategy {
    async fn recover(
        &self,
        error: &ErrorInfo,
        controller: Option<Arc<dyn ModuleController>>,
    ) -> Result<bool> {
        if let Some(controller) = controller {
            controller.release_resources(&error.module).await?;
        }
        Ok(true)
    }

    fn description(&self) -> &str {
        "释放资源"
    }
}

/// 重新解析依赖（用于依赖故障）
///
/// 尚未实现，总是返回未恢复。
pub struct DependencyResolutionStrategy;

#[async_trait]
impl RecoveryStrategy for DependencyResolutionStrategy {
    async fn recover(
        &self,
        _error: &ErrorInfo,
        _controller: Option<Arc<dyn ModuleController>>,
    ) -> Result<bool> {
        // TODO: 依赖失败后重新扫描模块仓库再解析一次
        Ok(false)
    }

    fn description(&self) -> &str {
        "重新解析依赖"
    }
}

// ==================== 故障处理器 ====================

enum FaultMessage {
    Error(ErrorInfo),
    Flush(oneshot::Sender<()>),
}

/// 故障处理器
pub struct FaultHandler {
    config: RwLock<FaultConfig>,
    strategies: RwLock<HashMap<ErrorCategory, Vec<Arc<dyn RecoveryStrategy>>>>,
    listeners: RwLock<Vec<(String, Arc<dyn FaultListener>)>>,
    statistics: Mutex<HashMap<String, ErrorStatistics>>,
    error_log: Mutex<VecDeque<ErrorInfo>>,
    total_errors: AtomicU64,
    recovered_errors: AtomicU64,
    controller: RwLock<Option<Weak<dyn ModuleController>>>,
    sender: mpsc::UnboundedSender<FaultMessage>,
}

impl FaultHandler {
    /// 创建故障处理器并启动后台处理任务
    ///
    /// 必须在 tokio 运行时内调用。默认注册三个恢复策略：
    /// 初始化故障重载模块、资源故障释放资源、依赖故障重新解析依赖。
    pub fn new(config: FaultConfig) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let reload_attempts = config.reload_max_attempts;

        let handler = Arc::new(Self {
            config: RwLock::new(config),
            strategies: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            statistics: Mutex::new(HashMap::new()),
            error_log: Mutex::new(VecDeque::new()),
            total_errors: AtomicU64::new(0),
            recovered_errors: AtomicU64::new(0),
            controller: RwLock::new(None),
            sender,
        });

        handler.register_strategy(
            ErrorCategory::Initialization,
            Arc::new(ReloadModuleStrategy::new(reload_attempts)),
        );
        handler.register_strategy(ErrorCategory::Resource, Arc::new(ReleaseResourcesStrategy));
        handler.register_strategy(
            ErrorCategory::Dependency,
            Arc::new(DependencyResolutionStrategy),
        );

        tokio::spawn(Self::worker(Arc::downgrade(&handler), receiver));
        handler
    }

    async fn worker(handler: Weak<Self>, mut receiver: mpsc::UnboundedReceiver<FaultMessage>) {
        while let Some(message) = receiver.recv().await {
            match message {
                FaultMessage::Error(info) => {
                    let Some(handler) = handler.upgrade() else {
                        break;
                    };
                    handler.process(&info).await;
                }
                FaultMessage::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("故障处理任务退出");
    }

    /// 设置模块控制器
    pub fn set_controller(&self, controller: Weak<dyn ModuleController>) {
        *self.controller.write().unwrap_or_else(PoisonError::into_inner) = Some(controller);
    }

    fn controller(&self) -> Option<Arc<dyn ModuleController>> {
        self.controller
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// 注册恢复策略，同一类别按注册顺序尝试
    pub fn register_strategy(&self, category: ErrorCategory, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(category)
            .or_default()
            .push(strategy);
    }

    /// 移除某类别的全部恢复策略
    pub fn clear_strategies(&self, category: ErrorCategory) {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&category);
    }

    /// 添加监听器，返回监听器 ID
    pub fn add_listener(&self, listener: Arc<dyn FaultListener>) -> String {
        let id = crate::utils::id::generate_id();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.clone(), listener));
        id
    }

    /// 移除监听器
    pub fn remove_listener(&self, id: &str) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| lid != id);
        listeners.len() != before
    }

    /// 替换配置
    pub fn reconfigure(&self, config: FaultConfig) {
        let max = config.max_error_log_size;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        let mut log = self.error_log.lock().unwrap_or_else(PoisonError::into_inner);
        while log.len() > max {
            log.pop_front();
        }
        info!(max_error_log_size = max, "故障处理器配置已更新");
    }

    // ==================== 记录 ====================

    /// 记录故障并交给后台异步处理，返回故障记录 ID
    pub fn log_error(
        &self,
        module: &str,
        level: ErrorLevel,
        category: ErrorCategory,
        message: impl Into<String>,
        cause: Option<String>,
    ) -> String {
        let info = self.record(ErrorInfo::new(module, level, category, message, cause));
        let id = info.id.clone();
        if self.sender.send(FaultMessage::Error(info)).is_err() {
            warn!(module = %module, "故障处理任务已停止，故障未被处理");
        }
        id
    }

    /// 记录模块故障并交给后台异步处理
    pub fn log_fault(&self, fault: &ModuleFault) -> String {
        let info = self.record(ErrorInfo::from_fault(fault));
        let id = info.id.clone();
        if self.sender.send(FaultMessage::Error(info)).is_err() {
            warn!(module = %fault.module, "故障处理任务已停止，故障未被处理");
        }
        id
    }

    /// 记录模块故障并立即处理
    pub async fn report(&self, fault: &ModuleFault) -> FaultOutcome {
        let info = self.record(ErrorInfo::from_fault(fault));
        self.process(&info).await
    }

    /// 等待此前入队的故障全部处理完毕
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(FaultMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn record(&self, mut info: ErrorInfo) -> ErrorInfo {
        let (min_level, max_size, stack_trace) = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (config.min_log_level, config.max_error_log_size, config.enable_stack_trace)
        };

        let thread = std::thread::current();
        info.context.insert(
            "thread".to_string(),
            thread.name().unwrap_or("unnamed").to_string(),
        );
        if stack_trace {
            info.capture_backtrace();
        }

        if info.level >= min_level && max_size > 0 {
            let mut log = self.error_log.lock().unwrap_or_else(PoisonError::into_inner);
            while log.len() >= max_size {
                log.pop_front();
            }
            log.push_back(info.clone());
        }

        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.statistics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(info.module.clone())
            .or_insert_with(|| ErrorStatistics::new(info.module.clone()))
            .record_error(&info);

        match info.level {
            ErrorLevel::Fatal | ErrorLevel::Critical => {
                error!(module = %info.module, level = %info.level, category = %info.category, "{}", info.message)
            }
            ErrorLevel::Error => {
                warn!(module = %info.module, level = %info.level, category = %info.category, "{}", info.message)
            }
            _ => {
                debug!(module = %info.module, level = %info.level, category = %info.category, "{}", info.message)
            }
        }
        info
    }

    // ==================== 处理 ====================

    async fn process(&self, info: &ErrorInfo) -> FaultOutcome {
        self.notify(|listener| listener.on_error(info));

        let report_dir = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .report_dir
            .clone();
        if let Some(dir) = report_dir {
            if let Err(e) = self.write_report(&dir, info).await {
                warn!(module = %info.module, error = %e, "写入故障报告失败");
            }
        }

        if info.level == ErrorLevel::Fatal {
            return self.handle_fatal(info).await;
        }

        let strategies = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&info.category)
            .cloned()
            .unwrap_or_default();
        if strategies.is_empty() {
            return FaultOutcome::Unrecovered;
        }

        for strategy in &strategies {
            match strategy.recover(info, self.controller()).await {
                Ok(true) => {
                    self.recovered_errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(stats) = self
                        .statistics
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_mut(&info.module)
                    {
                        stats.record_recovery();
                    }
                    info!(module = %info.module, strategy = strategy.description(), "故障已恢复");
                    self.notify(|listener| listener.on_recovery(info, strategy.description()));
                    return FaultOutcome::Recovered {
                        strategy: strategy.description().to_string(),
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    self.log_error(
                        &info.module,
                        ErrorLevel::Error,
                        ErrorCategory::Internal,
                        format!("恢复策略执行失败: {}", strategy.description()),
                        Some(e.to_string()),
                    );
                }
            }
        }

        warn!(module = %info.module, category = %info.category, "所有恢复策略均失败，卸载模块");
        self.unload(&info.module).await
    }

    async fn handle_fatal(&self, info: &ErrorInfo) -> FaultOutcome {
        self.notify(|listener| listener.on_fatal_error(info));
        error!(module = %info.module, "致命故障，卸载模块");
        self.unload(&info.module).await
    }

    async fn unload(&self, module: &str) -> FaultOutcome {
        let Some(controller) = self.controller() else {
            return FaultOutcome::Unrecovered;
        };
        match controller.unload_module(module).await {
            Ok(()) => FaultOutcome::Unloaded,
            Err(e) => {
                error!(module = %module, error = %e, "卸载故障模块失败");
                FaultOutcome::Unrecovered
            }
        }
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn FaultListener),
    {
        let listeners: Vec<Arc<dyn FaultListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!("故障监听器发生 panic，已忽略");
            }
        }
    }

    async fn write_report(&self, dir: &Path, info: &ErrorInfo) -> Result<()> {
        let enable_stack_trace = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .enable_stack_trace;

        let filename = format!(
            "error_{}_{}.log",
            info.module,
            info.timestamp.format("%Y-%m-%dT%H-%M-%S%.3f")
        );

        let mut report = String::new();
        report.push_str("=== CJMOD Error Report ===\n");
        report.push_str(&format!("Module: {}\n", info.module));
        report.push_str(&format!("Time: {}\n", info.timestamp.to_rfc3339()));
        report.push_str(&format!("Level: {}\n", info.level));
        report.push_str(&format!("Category: {}\n", info.category));
        report.push_str(&format!("Message: {}\n\n", info.message));

        if let Some(cause) = &info.cause {
            report.push_str("=== Exception ===\n");
            report.push_str(cause);
            report.push_str("\n\n");
        }

        if enable_stack_trace {
            if let Some(bt) = &info.backtrace {
                report.push_str("=== Stack Trace ===\n");
                report.push_str(bt);
                report.push_str("\n\n");
            }
        }

        report.push_str("=== Context ===\n");
        let mut keys: Vec<_> = info.context.keys().collect();
        keys.sort();
        for key in keys {
            report.push_str(&format!("{}: {}\n", key, info.context[key]));
        }

        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(filename), report).await?;
        Ok(())
    }

    // ==================== 查询 ====================

    /// 获取模块的故障统计
    pub fn statistics(&self, module: &str) -> Option<ErrorStatistics> {
        self.statistics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
    }

    /// 获取全局统计
    pub fn global_statistics(&self) -> GlobalStatistics {
        let total = self.total_errors.load(Ordering::Relaxed);
        let recovered = self.recovered_errors.load(Ordering::Relaxed);
        let stats = self.statistics.lock().unwrap_or_else(PoisonError::into_inner);

        let mut modules: Vec<(&String, u64)> =
            stats.iter().map(|(name, s)| (name, s.total)).collect();
        modules.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        GlobalStatistics {
            total_errors: total,
            recovered_errors: recovered,
            recovery_rate: if total > 0 {
                recovered as f64 / total as f64
            } else {
                0.0
            },
            module_count: stats.len(),
            top_error_modules: modules
                .into_iter()
                .take(10)
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }

    /// 获取最近的至多 `count` 条故障记录，按时间先后排列
    pub fn recent_errors(&self, count: usize) -> Vec<ErrorInfo> {
        let log = self.error_log.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = log.len().saturating_sub(count);
        log.iter().skip(skip).cloned().collect()
    }

    /// 清空故障记录与统计
    pub fn clear(&self) {
        self.error_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.statistics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.total_errors.store(0, Ordering::Relaxed);
        self.recovered_errors.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::CjmodError;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingController {
        reloads: AtomicUsize,
        unloads: Mutex<Vec<String>>,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl ModuleController for RecordingController {
        async fn reload_module(&self, _module: &str) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unload_module(&self, module: &str) -> Result<()> {
            self.unloads.lock().unwrap().push(module.to_string());
            Ok(())
        }

        async fn release_resources(&self, _module: &str) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingStrategy;

    #[async_trait]
    impl RecoveryStrategy for FailingStrategy {
        async fn recover(
            &self,
            _error: &ErrorInfo,
            _controller: Option<Arc<dyn ModuleController>>,
        ) -> Result<bool> {
            Err(CjmodError::Internal("策略崩溃".to_string()))
        }

        fn description(&self) -> &str {
            "总是失败"
        }
    }

    #[derive(Default)]
    struct CountingListener {
        errors: AtomicUsize,
        recoveries: AtomicUsize,
        fatals: AtomicUsize,
    }

    impl FaultListener for CountingListener {
        fn on_error(&self, _error: &ErrorInfo) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_recovery(&self, _error: &ErrorInfo, _strategy: &str) {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
        }

        fn on_fatal_error(&self, _error: &ErrorInfo) {
            self.fatals.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingListener;

    impl FaultListener for PanickingListener {
        fn on_error(&self, _error: &ErrorInfo) {
            panic!("listener panic");
        }
    }

    fn setup() -> (Arc<FaultHandler>, Arc<RecordingController>) {
        let handler = FaultHandler::new(FaultConfig {
            enable_stack_trace: false,
            ..Default::default()
        });
        let controller = Arc::new(RecordingController::default());
        let dyn_controller: Arc<dyn ModuleController> = controller.clone();
        handler.set_controller(Arc::downgrade(&dyn_controller));
        (handler, controller)
    }

    #[tokio::test]
    async fn test_fatal_unloads_module() {
        let (handler, controller) = setup();
        let listener = Arc::new(CountingListener::default());
        handler.add_listener(listener.clone());

        handler.log_error("m", ErrorLevel::Fatal, ErrorCategory::Execution, "崩溃", None);
        handler.flush().await;

        assert_eq!(controller.unloads.lock().unwrap().as_slice(), &["m".to_string()]);
        assert_eq!(listener.errors.load(Ordering::SeqCst), 1);
        assert_eq!(listener.fatals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resource_fault_recovered() {
        let (handler, controller) = setup();
        let fault = ModuleFault::new("m", ErrorCategory::Resource, ErrorLevel::Error, "内存不足");

        let outcome = handler.report(&fault).await;

        assert_eq!(
            outcome,
            FaultOutcome::Recovered {
                strategy: "释放资源".to_string()
            }
        );
        assert_eq!(controller.releases.load(Ordering::SeqCst), 1);
        assert_eq!(handler.statistics("m").unwrap().recovered, 1);
        assert_eq!(handler.global_statistics().recovered_errors, 1);
    }

    #[tokio::test]
    async fn test_no_strategy_records_only() {
        let (handler, controller) = setup();
        let fault = ModuleFault::new("m", ErrorCategory::Security, ErrorLevel::Error, "越权");

        let outcome = handler.report(&fault).await;

        assert_eq!(outcome, FaultOutcome::Unrecovered);
        assert!(controller.unloads.lock().unwrap().is_empty());
        assert_eq!(handler.statistics("m").unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_failed_strategies_unload_and_log_internal() {
        let (handler, controller) = setup();
        handler.register_strategy(ErrorCategory::Communication, Arc::new(FailingStrategy));
        let fault = ModuleFault::new("m", ErrorCategory::Communication, ErrorLevel::Error, "断开");

        let outcome = handler.report(&fault).await;
        handler.flush().await;

        assert_eq!(outcome, FaultOutcome::Unloaded);
        assert_eq!(controller.unloads.lock().unwrap().len(), 1);
        let stats = handler.statistics("m").unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count_for_category(ErrorCategory::Internal), 1);
    }

    struct BrokenController;

    #[async_trait]
    impl ModuleController for BrokenController {
        async fn reload_module(&self, module: &str) -> Result<()> {
            Err(CjmodError::ModuleNotFound(module.to_string()))
        }

        async fn unload_module(&self, _module: &str) -> Result<()> {
            Ok(())
        }

        async fn release_resources(&self, _module: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reload_attempts_are_bounded() {
        let strategy = ReloadModuleStrategy::new(2);
        let info = ErrorInfo::new("m", ErrorLevel::Error, ErrorCategory::Initialization, "x", None);
        let ok: Arc<dyn ModuleController> = Arc::new(RecordingController::default());
        let broken: Arc<dyn ModuleController> = Arc::new(BrokenController);

        // 成功的重载会清零计数
        assert!(strategy.recover(&info, Some(ok.clone())).await.unwrap());
        assert!(strategy.recover(&info, Some(ok.clone())).await.unwrap());
        assert!(strategy.recover(&info, Some(ok.clone())).await.unwrap());

        assert!(!strategy.recover(&info, Some(broken.clone())).await.unwrap());
        assert!(!strategy.recover(&info, Some(broken.clone())).await.unwrap());
        // 已达到上限，即使控制器恢复正常也不再尝试
        assert!(!strategy.recover(&info, Some(ok)).await.unwrap());
        assert!(!strategy.recover(&info, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_listener_panic_is_isolated() {
        let (handler, _controller) = setup();
        let counting = Arc::new(CountingListener::default());
        handler.add_listener(Arc::new(PanickingListener));
        handler.add_listener(counting.clone());

        handler.log_error("m", ErrorLevel::Warning, ErrorCategory::Execution, "w", None);
        handler.flush().await;

        assert_eq!(counting.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ring_buffer_and_min_level() {
        let handler = FaultHandler::new(FaultConfig {
            max_error_log_size: 3,
            min_log_level: ErrorLevel::Warning,
            enable_stack_trace: false,
            ..Default::default()
        });

        handler.log_error("m", ErrorLevel::Debug, ErrorCategory::Execution, "ignored", None);
        for i in 0..5 {
            handler.log_error("m", ErrorLevel::Error, ErrorCategory::Execution, format!("e{}", i), None);
        }

        let recent = handler.recent_errors(10);
        let messages: Vec<_> = recent.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
        assert_eq!(handler.statistics("m").unwrap().total, 6);
    }

    #[tokio::test]
    async fn test_report_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FaultHandler::new(FaultConfig {
            report_dir: Some(dir.path().to_path_buf()),
            enable_stack_trace: false,
            ..Default::default()
        });

        handler.log_error(
            "writer",
            ErrorLevel::Error,
            ErrorCategory::Execution,
            "写入失败",
            Some("disk full".to_string()),
        );
        handler.flush().await;

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let path = entries[0].as_ref().unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("error_writer_"));
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with("=== CJMOD Error Report ==="));
        assert!(content.contains("=== Exception ===\ndisk full"));
        assert!(content.contains("=== Context ==="));
    }

    #[tokio::test]
    async fn test_global_statistics_top_modules() {
        let (handler, _controller) = setup();
        for _ in 0..3 {
            handler.log_error("a", ErrorLevel::Info, ErrorCategory::Execution, "x", None);
        }
        handler.log_error("b", ErrorLevel::Info, ErrorCategory::Execution, "x", None);
        handler.flush().await;

        let stats = handler.global_statistics();
        assert_eq!(stats.total_errors, 4);
        assert_eq!(stats.module_count, 2);
        assert_eq!(stats.top_error_modules, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(stats.recovery_rate, 0.0);
    }
}
