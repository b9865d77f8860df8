//! CJMOD 运行时 SDK
//!
//! `CjmodRuntime` 是运行时的显式实例。宿主（编译器）在进程启动时创建一次，
//! 之后通过引用把它传给需要加载或调用模块的组件。它把以下组件装配在一起：
//!
//! - 模块仓库与加载器链（归档模块、目录模块）
//! - 生命周期管理器（状态机、依赖级联、单次加载）
//! - 沙箱执行器、故障处理器、全局状态存储与函数结果缓存
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cjmod_runtime::{CjmodRuntime, ModuleFactoryRegistry, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::builder()
//!         .module_path("./modules")
//!         .log_level("info")
//!         .build();
//!
//!     let factories = Arc::new(ModuleFactoryRegistry::new());
//!     // factories.register("chtl.ui.Module", || MyModule::default());
//!
//!     let runtime = CjmodRuntime::new(config, factories).await?;
//!     runtime.start().await?;
//!
//!     let result = runtime
//!         .execute_function("chtl-ui", "render", Default::default())
//!         .await?;
//!     println!("{}", result.value);
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::config::RuntimeConfig;
use crate::fault::{FaultHandler, FaultListener, GlobalStatistics};
use crate::module::{
    ArchiveLoader, CacheStats, DirectoryLoader, ExecutionOptions, FunctionCache, FunctionParams,
    FunctionResult, InstalledModule, LifecycleListener, LifecycleManager, LifecycleServices,
    LoadedModule, LoaderChain, ModuleFactoryRegistry, ModuleRepository, StateStore,
};
use crate::sandbox::SandboxEnforcer;
use crate::utils::{CjmodError, LogGuard, Logger, Result};

// ============================================================================
// 运行时状态
// ============================================================================

/// 运行时状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// 已创建，尚未启动
    Initialized,
    /// 运行中
    Running,
    /// 正在关闭
    ShuttingDown,
    /// 已关闭
    Shutdown,
}

impl RuntimeState {
    /// 检查是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, RuntimeState::Initialized)
    }

    /// 检查是否可以关闭
    pub fn can_shutdown(&self) -> bool {
        matches!(self, RuntimeState::Initialized | RuntimeState::Running)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RuntimeState::Running)
    }
}

// ============================================================================
// CjmodRuntime
// ============================================================================

/// CJMOD 运行时
///
/// # 生命周期
///
/// 1. `new()` - 按配置装配所有组件
/// 2. `start()` - 扫描模块路径并加载 `auto_load` 中的模块
/// 3. `shutdown()` - 按依赖逆序卸载全部模块，保存全局状态
///
/// 未启动时也可以直接加载和调用模块，`start` 只负责扫描和自动加载。
pub struct CjmodRuntime {
    /// 运行时配置
    config: RuntimeConfig,

    /// 运行时状态
    state: RwLock<RuntimeState>,

    /// 入口点符号表
    factories: Arc<ModuleFactoryRegistry>,

    /// 生命周期管理器
    lifecycle: Arc<LifecycleManager>,

    /// 启动时间
    started_at: Mutex<Option<Instant>>,
}

impl CjmodRuntime {
    /// 创建运行时实例
    ///
    /// 必须在 tokio 运行时内调用。配置了状态持久化文件且文件存在时，会先载入全局状态。
    ///
    /// # Errors
    ///
    /// 配置校验失败或状态文件无法读取时返回错误
    pub async fn new(config: RuntimeConfig, factories: Arc<ModuleFactoryRegistry>) -> Result<Self> {
        info!("初始化 CJMOD 运行时 v{}", crate::VERSION);
        config.validate()?;

        // 1. 故障处理器（内置默认恢复策略）
        let faults = FaultHandler::new(config.faults.clone());
        debug!("故障处理器初始化完成");

        // 2. 沙箱执行器
        let enforcer = Arc::new(SandboxEnforcer::new(
            config.sandbox_policy(),
            config.sandbox.system_properties.clone(),
        ));
        debug!(profile = %config.effective_profile(), "沙箱执行器初始化完成");

        // 3. 加载器链：归档优先，其次目录
        let modules = &config.modules;
        let loaders = LoaderChain::new()
            .with_loader(Arc::new(
                ArchiveLoader::new(Arc::clone(&factories))
                    .with_extensions(modules.archive_extensions.clone()),
            ))
            .with_loader(Arc::new(
                DirectoryLoader::new(Arc::clone(&factories))
                    .with_build_command(modules.build_command.clone())
                    .with_source_extensions(modules.source_extensions.clone()),
            ));
        debug!(loaders = ?loaders.loader_types(), "加载器链初始化完成");

        // 4. 模块仓库
        let repository = Arc::new(ModuleRepository::new(
            modules.repository_root.clone(),
            modules.module_paths.clone(),
        ));

        // 5. 全局状态
        let state_store = Arc::new(StateStore::new());
        if let Some(path) = &config.state.persistence_file {
            if path.exists() {
                let count = state_store.load_from_file(path).await?;
                info!(path = ?path, count, "已载入全局状态");
            }
        }

        // 6. 生命周期管理器
        let mut services = LifecycleServices::new(repository, loaders, faults)
            .with_enforcer(enforcer)
            .with_state(state_store)
            .with_settings(modules.settings.clone())
            .with_timeout_error_threshold(config.sandbox.timeout_error_threshold);
        if config.cache.enabled {
            services = services.with_cache(Arc::new(FunctionCache::new(
                config.cache.capacity,
                config.cache.ttl(),
            )));
        }
        let lifecycle = LifecycleManager::new(services);

        info!("CJMOD 运行时初始化完成");
        Ok(Self {
            config,
            state: RwLock::new(RuntimeState::Initialized),
            factories,
            lifecycle,
            started_at: Mutex::new(None),
        })
    }

    /// 启动运行时
    ///
    /// 扫描模块路径，然后按顺序加载 `auto_load` 中的模块。
    /// 单个自动加载失败只记录警告，不影响启动。
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.can_start() {
            return Err(CjmodError::InitFailed(format!(
                "运行时当前状态 {:?} 不允许启动",
                *state
            )));
        }

        info!("启动 CJMOD 运行时...");
        let found = self.scan().await?;
        debug!(count = found.len(), "模块路径扫描完成");

        for name in &self.config.modules.auto_load {
            match self.lifecycle.load_module(name).await {
                Ok(module) => info!(module = %name, version = %module.version(), "自动加载完成"),
                Err(e) => warn!(module = %name, error = %e, "自动加载失败"),
            }
        }

        *state = RuntimeState::Running;
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        info!("CJMOD 运行时已启动");
        Ok(())
    }

    /// 关闭运行时
    ///
    /// 卸载全部模块（依赖方先于被依赖方），保存全局状态，等待故障队列处理完毕。
    /// 重复调用静默返回。
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.can_shutdown() {
            return Ok(());
        }

        info!("正在关闭 CJMOD 运行时...");
        *state = RuntimeState::ShuttingDown;

        self.lifecycle.shutdown().await;

        let persisted = match &self.config.state.persistence_file {
            Some(path) => self
                .lifecycle
                .state_store()
                .save_to_file(path)
                .await
                .map(|count| {
                    debug!(path = ?path, count, "全局状态已保存");
                }),
            None => Ok(()),
        };

        self.lifecycle.fault_handler().flush().await;

        *state = RuntimeState::Shutdown;
        info!("CJMOD 运行时已关闭");
        persisted
    }

    // ========================================================================
    // 仓库
    // ========================================================================

    /// 扫描模块路径，返回新注册的模块全名
    pub async fn scan(&self) -> Result<Vec<String>> {
        self.lifecycle
            .repository()
            .scan(self.lifecycle.loaders())
            .await
    }

    /// 安装模块（目录或归档）到仓库根目录
    pub async fn install(&self, source: impl AsRef<Path>) -> Result<InstalledModule> {
        self.lifecycle
            .repository()
            .install(source.as_ref(), self.lifecycle.loaders())
            .await
    }

    /// 已安装的全部模块
    pub async fn installed_modules(&self) -> Vec<InstalledModule> {
        self.lifecycle.repository().list().await
    }

    // ========================================================================
    // 模块生命周期
    // ========================================================================

    /// 加载模块及其依赖，返回激活后的模块
    pub async fn load_module(&self, name: &str) -> Result<LoadedModule> {
        self.lifecycle.load_module(name).await
    }

    /// 卸载模块，依赖它的模块先被卸载
    pub async fn unload_module(&self, name: &str) -> Result<()> {
        self.lifecycle.unload_module(name).await
    }

    /// 重新加载模块
    pub async fn reload_module(&self, name: &str) -> Result<LoadedModule> {
        self.lifecycle.reload_module(name).await
    }

    /// 挂起模块
    pub async fn suspend_module(&self, name: &str) -> Result<LoadedModule> {
        self.lifecycle.suspend_module(name).await
    }

    /// 恢复挂起的模块
    pub async fn resume_module(&self, name: &str) -> Result<LoadedModule> {
        self.lifecycle.resume_module(name).await
    }

    pub fn get_module(&self, name: &str) -> Option<LoadedModule> {
        self.lifecycle.get_module(name)
    }

    pub fn get_all_modules(&self) -> Vec<LoadedModule> {
        self.lifecycle.get_all_modules()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.lifecycle.is_loaded(name)
    }

    // ========================================================================
    // 执行
    // ========================================================================

    /// 执行模块导出函数
    pub async fn execute_function(
        &self,
        module: &str,
        function: &str,
        params: FunctionParams,
    ) -> Result<FunctionResult> {
        self.lifecycle.execute_function(module, function, params).await
    }

    /// 执行模块导出函数，附带编译位置与 DOM 句柄
    pub async fn execute_function_with(
        &self,
        module: &str,
        function: &str,
        params: FunctionParams,
        options: ExecutionOptions,
    ) -> Result<FunctionResult> {
        self.lifecycle
            .execute_function_with(module, function, params, options)
            .await
    }

    // ========================================================================
    // 监听器
    // ========================================================================

    /// 注册生命周期监听器，返回监听器 ID
    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) -> String {
        self.lifecycle.add_listener(listener)
    }

    pub fn remove_lifecycle_listener(&self, id: &str) -> bool {
        self.lifecycle.remove_listener(id)
    }

    /// 注册故障监听器，返回监听器 ID
    pub fn add_fault_listener(&self, listener: Arc<dyn FaultListener>) -> String {
        self.lifecycle.fault_handler().add_listener(listener)
    }

    pub fn remove_fault_listener(&self, id: &str) -> bool {
        self.lifecycle.fault_handler().remove_listener(id)
    }

    // ========================================================================
    // 访问器
    // ========================================================================

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 按 `logging` 配置初始化全局日志
    ///
    /// 全局订阅者只能设置一次，重复调用返回空守卫。
    pub fn init_logging(&self) -> LogGuard {
        Logger::init_from_config(&self.config.logging)
    }

    pub fn factories(&self) -> &Arc<ModuleFactoryRegistry> {
        &self.factories
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn repository(&self) -> &Arc<ModuleRepository> {
        self.lifecycle.repository()
    }

    pub fn fault_handler(&self) -> &Arc<FaultHandler> {
        self.lifecycle.fault_handler()
    }

    pub fn enforcer(&self) -> &Arc<SandboxEnforcer> {
        self.lifecycle.enforcer()
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        self.lifecycle.state_store()
    }

    pub async fn state(&self) -> RuntimeState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.is_running()
    }

    /// 运行时长，未启动时为 None
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|started| started.elapsed())
    }

    /// 运行时概况
    pub async fn info(&self) -> RuntimeInfo {
        RuntimeInfo {
            state: self.state().await,
            uptime_secs: self.uptime().map(|d| d.as_secs()),
            loaded_modules: self.lifecycle.module_count(),
            installed_modules: self.lifecycle.repository().list().await.len(),
            faults: self.lifecycle.fault_handler().global_statistics(),
            cache: self.lifecycle.cache().map(|cache| cache.stats()),
        }
    }
}

impl std::fmt::Debug for CjmodRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CjmodRuntime")
            .field("loaded_modules", &self.lifecycle.module_count())
            .field("entry_points", &self.factories.entry_points())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// 运行时概况
// ============================================================================

/// 运行时概况
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub state: RuntimeState,
    /// 运行时间（秒）
    pub uptime_secs: Option<u64>,
    pub loaded_modules: usize,
    pub installed_modules: usize,
    /// 故障统计
    pub faults: GlobalStatistics,
    /// 函数缓存统计，禁用缓存时为 None
    pub cache: Option<CacheStats>,
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{CjmodModule, ExecutionContext, FunctionSignature, ModuleState, Parameter};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl CjmodModule for Echo {
        fn functions(&self) -> Vec<FunctionSignature> {
            vec![FunctionSignature::new("echo", vec![Parameter::required("text", "string")])]
        }

        async fn execute(
            &self,
            _function: &str,
            params: FunctionParams,
            _context: &ExecutionContext,
        ) -> Result<FunctionResult> {
            Ok(FunctionResult::new(params["text"].clone()))
        }
    }

    fn write_module(root: &Path, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("module.json"),
            json!({"name": name, "version": "1.0.0", "entryPoint": "demo.Echo"}).to_string(),
        )
        .unwrap();
    }

    async fn runtime(dir: &TempDir) -> CjmodRuntime {
        write_module(dir.path(), "echo");
        let factories = Arc::new(ModuleFactoryRegistry::new());
        factories.register("demo.Echo", || Echo);
        let config = RuntimeConfig::builder()
            .module_paths(vec![dir.path().to_path_buf()])
            .repository_root(dir.path().join("repo"))
            .auto_load("echo")
            .state_file(dir.path().join("state.json"))
            .build();
        CjmodRuntime::new(config, factories).await.unwrap()
    }

    #[tokio::test]
    async fn test_runtime_start_shutdown() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;
        let _guard = runtime.init_logging();
        assert_eq!(runtime.state().await, RuntimeState::Initialized);
        assert!(runtime.uptime().is_none());

        runtime.start().await.unwrap();
        assert!(runtime.is_running().await);
        assert_eq!(runtime.get_module("echo").unwrap().state, ModuleState::Active);

        let info = runtime.info().await;
        assert_eq!(info.loaded_modules, 1);
        assert_eq!(info.installed_modules, 1);
        assert!(info.cache.is_some());

        runtime.shutdown().await.unwrap();
        assert_eq!(runtime.state().await, RuntimeState::Shutdown);
        assert!(runtime.get_all_modules().is_empty());
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;
        runtime.start().await.unwrap();
        assert!(matches!(runtime.start().await, Err(CjmodError::InitFailed(_))));
        runtime.shutdown().await.unwrap();
        // 重复关闭静默返回
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_through_runtime() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;
        runtime.start().await.unwrap();

        let mut params = FunctionParams::new();
        params.insert("text".to_string(), json!("hi"));
        let result = runtime.execute_function("echo", "echo", params).await.unwrap();
        assert_eq!(result.value, json!("hi"));
    }

    #[tokio::test]
    async fn test_state_persisted_across_instances() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir).await;
        runtime.state_store().set_global("theme", json!("dark"), "host");
        runtime.shutdown().await.unwrap();

        let restored = self::runtime(&dir).await;
        assert_eq!(restored.state_store().get_global("theme"), Some(json!("dark")));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = RuntimeConfig::builder().cache(0, Duration::from_secs(1)).build();
        let result = CjmodRuntime::new(config, Arc::new(ModuleFactoryRegistry::new())).await;
        assert!(matches!(result, Err(CjmodError::InvalidConfigValue { .. })));
    }
}
