//! 生命周期管理器
//!
//! 维护已加载模块的注册表与状态机：
//!
//! ```text
//! LOADING → LOADED → INITIALIZED → ACTIVE ⇄ SUSPENDED
//!     任意非终止状态 → ERROR，任意状态 → UNLOADED
//! ```
//!
//! 同名模块同一时刻最多只有一次加载在进行，并发调用方共享同一个结果。
//! 卸载会级联卸载所有以该模块为必需依赖的模块，依赖方先于被依赖方进入 `UNLOADED`。

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use futures::future::{self, join_all, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tracing::{debug, info, instrument, warn, Instrument};

use super::cache::{CacheKey, FunctionCache};
use super::context::{CompilationContext, DomHandle, ExecutionContext, ModuleInvoker};
use super::dependency::{DependencyGraph, DependencyGraphResolver};
use super::loader::{LoadedArtifact, LoaderChain};
use super::metadata::{FunctionParams, FunctionResult, LoadedModule, ModuleState};
use super::repository::ModuleRepository;
use super::runtime::{CjmodModule, InitContext, LinkUnit};
use super::state::StateStore;
use super::version::VersionRange;
use crate::fault::{ErrorCategory, ErrorLevel, FaultHandler, FaultOutcome, ModuleController, ModuleFault};
use crate::sandbox::SandboxEnforcer;
use crate::utils::{generate_id, CjmodError, Result};

/// 默认的连续超时阈值
pub const DEFAULT_TIMEOUT_ERROR_THRESHOLD: u32 = 3;

type LoadOutcome = std::result::Result<LoadedModule, ModuleFault>;
type LoadFuture = Shared<BoxFuture<'static, LoadOutcome>>;

// ==================== 监听器 ====================

/// 生命周期监听器
///
/// 所有方法都有空的默认实现。监听器中的 panic 会被捕获并忽略。
pub trait LifecycleListener: Send + Sync {
    fn on_loaded(&self, _module: &LoadedModule) {}

    fn on_initialized(&self, _module: &LoadedModule) {}

    /// 激活或从挂起恢复
    fn on_activated(&self, _module: &LoadedModule) {}

    fn on_suspended(&self, _module: &LoadedModule) {}

    fn on_unloaded(&self, _module: &LoadedModule) {}

    /// 加载失败时模块可能尚未进入注册表，因此只给出名称
    fn on_error(&self, _module: &str, _fault: &ModuleFault) {}
}

// ==================== 协作组件 ====================

/// 生命周期管理器依赖的组件
pub struct LifecycleServices {
    pub repository: Arc<ModuleRepository>,
    pub loaders: LoaderChain,
    pub enforcer: Arc<SandboxEnforcer>,
    pub faults: Arc<FaultHandler>,
    pub state: Arc<StateStore>,
    /// 为空时不缓存函数结果
    pub cache: Option<Arc<FunctionCache>>,
    /// 模块名 -> 初始化配置
    pub settings: HashMap<String, HashMap<String, Value>>,
    /// 连续超时达到该次数后模块进入 ERROR
    pub timeout_error_threshold: u32,
}

impl LifecycleServices {
    pub fn new(repository: Arc<ModuleRepository>, loaders: LoaderChain, faults: Arc<FaultHandler>) -> Self {
        Self {
            repository,
            loaders,
            enforcer: Arc::new(SandboxEnforcer::default()),
            faults,
            state: Arc::new(StateStore::new()),
            cache: None,
            settings: HashMap::new(),
            timeout_error_threshold: DEFAULT_TIMEOUT_ERROR_THRESHOLD,
        }
    }

    pub fn with_enforcer(mut self, enforcer: Arc<SandboxEnforcer>) -> Self {
        self.enforcer = enforcer;
        self
    }

    pub fn with_state(mut self, state: Arc<StateStore>) -> Self {
        self.state = state;
        self
    }

    pub fn with_cache(mut self, cache: Arc<FunctionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_settings(mut self, settings: HashMap<String, HashMap<String, Value>>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_timeout_error_threshold(mut self, threshold: u32) -> Self {
        self.timeout_error_threshold = threshold.max(1);
        self
    }
}

/// 单次执行的附加输入
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    /// 调用发生处的编译位置
    pub compilation: CompilationContext,
    /// 宿主提供的 DOM 构建器句柄
    pub dom: Option<DomHandle>,
}

struct ModuleEntry {
    module: LoadedModule,
    instance: Arc<dyn CjmodModule>,
    link: Arc<LinkUnit>,
    consecutive_timeouts: u32,
}

// ==================== 生命周期管理器 ====================

/// 生命周期管理器
///
/// 通过 [`LifecycleManager::new`] 创建后以 `Arc` 共享；创建时会把自身注册为故障处理器的控制器。
pub struct LifecycleManager {
    this: Weak<LifecycleManager>,
    repository: Arc<ModuleRepository>,
    loaders: LoaderChain,
    enforcer: Arc<SandboxEnforcer>,
    faults: Arc<FaultHandler>,
    state: Arc<StateStore>,
    cache: Option<Arc<FunctionCache>>,
    settings: HashMap<String, HashMap<String, Value>>,
    timeout_error_threshold: u32,

    registry: RwLock<HashMap<String, ModuleEntry>>,
    /// 已加载模块之间的必需依赖边
    graph: RwLock<DependencyGraph>,
    in_flight: Mutex<HashMap<String, LoadFuture>>,
    unloading: Mutex<HashSet<String>>,
    listeners: RwLock<Vec<(String, Arc<dyn LifecycleListener>)>>,
}

impl LifecycleManager {
    pub fn new(services: LifecycleServices) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this: &Weak<LifecycleManager>| Self {
            this: this.clone(),
            repository: services.repository,
            loaders: services.loaders,
            enforcer: services.enforcer,
            faults: services.faults,
            state: services.state,
            cache: services.cache,
            settings: services.settings,
            timeout_error_threshold: services.timeout_error_threshold.max(1),
            registry: RwLock::new(HashMap::new()),
            graph: RwLock::new(DependencyGraph::new()),
            in_flight: Mutex::new(HashMap::new()),
            unloading: Mutex::new(HashSet::new()),
            listeners: RwLock::new(Vec::new()),
        });

        let controller: Arc<dyn ModuleController> = manager.clone();
        manager.faults.set_controller(Arc::downgrade(&controller));
        info!(loaders = ?manager.loaders.loader_types(), "生命周期管理器已创建");
        manager
    }

    pub fn repository(&self) -> &Arc<ModuleRepository> {
        &self.repository
    }

    pub fn loaders(&self) -> &LoaderChain {
        &self.loaders
    }

    pub fn enforcer(&self) -> &Arc<SandboxEnforcer> {
        &self.enforcer
    }

    pub fn fault_handler(&self) -> &Arc<FaultHandler> {
        &self.faults
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn cache(&self) -> Option<&Arc<FunctionCache>> {
        self.cache.as_ref()
    }

    fn handle(&self) -> Result<Arc<Self>> {
        self.this
            .upgrade()
            .ok_or_else(|| CjmodError::Internal("生命周期管理器已释放".to_string()))
    }

    // ==================== 监听器 ====================

    /// 注册监听器，返回用于移除的 ID
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) -> String {
        let id = generate_id();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.clone(), listener));
        id
    }

    pub fn remove_listener(&self, id: &str) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| listener_id != id);
        listeners.len() != before
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn LifecycleListener),
    {
        let listeners: Vec<Arc<dyn LifecycleListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!("生命周期监听器发生 panic，已忽略");
            }
        }
    }

    // ==================== 查询 ====================

    pub fn get_module(&self, name: &str) -> Option<LoadedModule> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|entry| entry.module.clone())
    }

    /// 所有已加载模块，按名称排序
    pub fn get_all_modules(&self) -> Vec<LoadedModule> {
        let mut modules: Vec<LoadedModule> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.module.clone())
            .collect();
        modules.sort_by(|a, b| a.name().cmp(b.name()));
        modules
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|entry| entry.module.state)
    }

    pub fn module_count(&self) -> usize {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 已加载模块中直接或间接以 `name` 为必需依赖的模块
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .all_dependents(name)
    }

    // ==================== 状态转换 ====================

    fn transition(&self, name: &str, to: ModuleState) -> Result<LoadedModule> {
        let snapshot = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let entry = registry
                .get_mut(name)
                .ok_or_else(|| CjmodError::ModuleNotLoaded(name.to_string()))?;
            let from = entry.module.state;
            if !from.can_transition_to(to) {
                return Err(CjmodError::InvalidStateTransition {
                    module: name.to_string(),
                    from,
                    to,
                });
            }
            entry.module.state = to;
            entry.module.clone()
        };

        debug!(module = %name, state = %to, "模块状态变更");
        match to {
            ModuleState::Loaded => self.notify(|l| l.on_loaded(&snapshot)),
            ModuleState::Initialized => self.notify(|l| l.on_initialized(&snapshot)),
            ModuleState::Active => self.notify(|l| l.on_activated(&snapshot)),
            ModuleState::Suspended => self.notify(|l| l.on_suspended(&snapshot)),
            ModuleState::Unloaded => self.notify(|l| l.on_unloaded(&snapshot)),
            ModuleState::Loading | ModuleState::Error => {}
        }
        Ok(snapshot)
    }

    fn mark_error(&self, name: &str, fault: &ModuleFault) {
        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = registry.get_mut(name) {
                if entry.module.state.can_transition_to(ModuleState::Error) {
                    entry.module.state = ModuleState::Error;
                }
            }
        }
        crate::log_fault!(fault);
        self.notify(|l| l.on_error(name, fault));
    }

    // ==================== 加载 ====================

    /// 加载模块及其依赖
    ///
    /// 已加载且不处于 ERROR 的模块直接返回现有快照。
    #[instrument(skip(self))]
    pub async fn load_module(&self, name: &str) -> Result<LoadedModule> {
        let this = self.handle()?;
        this.load_shared(name, VersionRange::any())
            .await
            .map_err(CjmodError::Fault)
    }

    fn load_shared(self: &Arc<Self>, name: &str, range: VersionRange) -> LoadFuture {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = in_flight.get(name) {
            debug!(module = %name, "复用进行中的加载");
            return pending.clone();
        }
        if let Some(existing) = self.get_module(name) {
            if existing.state != ModuleState::Error {
                return future::ready(Ok(existing)).boxed().shared();
            }
        }

        let this = Arc::clone(self);
        let owned = name.to_string();
        let pending = async move { this.load_inner(owned, range).await }
            .boxed()
            .shared();
        in_flight.insert(name.to_string(), pending.clone());
        pending
    }

    async fn load_inner(self: Arc<Self>, name: String, range: VersionRange) -> LoadOutcome {
        let outcome = self.load_steps(&name, &range).await.map_err(|e| {
            let fault = ModuleFault::from_error(&name, &e);
            self.mark_error(&name, &fault);
            fault
        });
        // 恢复策略可能重新加载同名模块，先让出单飞占位
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name);

        match outcome {
            Ok(module) => Ok(module),
            Err(fault) => self.recover_load(&name, fault).await,
        }
    }

    /// 加载故障在返回给调用方之前交给故障处理器，恢复后以模块当前快照作为结果
    async fn recover_load(&self, name: &str, fault: ModuleFault) -> LoadOutcome {
        match self.faults.report(&fault).await {
            FaultOutcome::Recovered { strategy } => match self.get_module(name) {
                Some(module) if module.state == ModuleState::Active => {
                    info!(module = %name, strategy = %strategy, "加载故障已恢复");
                    Ok(module)
                }
                _ => Err(fault),
            },
            FaultOutcome::Unrecovered | FaultOutcome::Unloaded => Err(fault),
        }
    }

    async fn load_steps(self: &Arc<Self>, name: &str, range: &VersionRange) -> Result<LoadedModule> {
        info!(module = %name, range = %range.expression(), "开始加载模块");

        let snapshot = self.repository.snapshot().await;
        let resolution = DependencyGraphResolver::new(&snapshot).resolve(name, range);
        let installed = resolution
            .get(name)
            .cloned()
            .ok_or_else(|| CjmodError::ModuleNotFound(name.to_string()))?;
        for warning in resolution.warnings() {
            warn!(module = %name, "{}", warning);
        }
        if !resolution.is_success() {
            return Err(CjmodError::DependencyResolution {
                module: name.to_string(),
                errors: resolution.errors().to_vec(),
            });
        }
        // 有环时在加载依赖之前失败，否则互相等待
        resolution.load_order()?;
        let closure = resolution.dependency_graph().all_dependencies(name);

        let (dependencies, pending): (Vec<_>, Vec<_>) = installed
            .descriptor
            .dependencies
            .iter()
            .filter_map(|dep| {
                let resolved = resolution.get(&dep.name)?;
                let range = VersionRange::exact(&resolved.descriptor.version);
                Some((dep.clone(), self.load_shared(&dep.name, range)))
            })
            .unzip();

        let mut failures = Vec::new();
        for (dep, outcome) in dependencies.iter().zip(join_all(pending).await) {
            match outcome {
                // 已加载但被挂起的必需依赖不能支撑新模块激活
                Ok(loaded) if !dep.optional && loaded.state != ModuleState::Active => {
                    return Err(CjmodError::ModuleNotActive {
                        module: dep.name.clone(),
                        state: loaded.state,
                    });
                }
                Ok(loaded) if !dep.range.contains(loaded.version()) => {
                    warn!(
                        module = %name,
                        dependency = %dep.name,
                        loaded = %loaded.version(),
                        required = %dep.range.expression(),
                        "已加载的依赖版本不满足要求"
                    );
                }
                Ok(_) => {}
                Err(fault) if dep.optional => {
                    warn!(module = %name, dependency = %dep.name, error = %fault, "可选依赖加载失败，已忽略");
                }
                Err(fault) => failures.push(format!("{}: {}", dep.name, fault.message)),
            }
        }
        if !failures.is_empty() {
            return Err(CjmodError::DependencyResolution {
                module: name.to_string(),
                errors: failures,
            });
        }

        let LoadedArtifact { module, instance } = self.loaders.load(&installed.path).await?;
        let classpath: Vec<PathBuf> = module
            .metadata
            .get("classpath")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(Value::as_str).map(PathBuf::from).collect())
            .unwrap_or_default();
        let link = LinkUnit::new(name, module.version().clone(), module.descriptor.entry_point.clone())
            .with_dependencies(closure)
            .with_classpath(classpath);
        let required: Vec<String> = module
            .descriptor
            .required_dependencies()
            .map(|dep| dep.name.clone())
            .collect();

        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                name.to_string(),
                ModuleEntry {
                    module,
                    instance: Arc::clone(&instance),
                    link: Arc::new(link),
                    consecutive_timeouts: 0,
                },
            );
        {
            let mut graph = self.graph.write().unwrap_or_else(PoisonError::into_inner);
            graph.add_module(name);
            for dep in required.iter().filter(|dep| self.is_loaded(dep)) {
                graph.add_dependency(name, dep);
            }
        }
        self.transition(name, ModuleState::Loaded)?;

        let sandbox = self.enforcer.create_context(name);
        let settings = self.settings.get(name).cloned().unwrap_or_default();
        let init_context = InitContext::new(name, settings, Arc::clone(&sandbox));
        self.enforcer
            .run(&sandbox, instance.initialize(&init_context))
            .await
            .map_err(|e| match e.category() {
                ErrorCategory::Security | ErrorCategory::Resource => e,
                _ if e.as_fault().is_some() => e,
                _ => CjmodError::InitFailed(e.to_string()),
            })?;
        self.transition(name, ModuleState::Initialized)?;
        let active = self.transition(name, ModuleState::Active)?;

        info!(module = %name, version = %active.version(), loader = %active.loader_type, "模块已激活");
        Ok(active)
    }

    // ==================== 执行 ====================

    /// 执行模块导出函数
    pub async fn execute_function(
        &self,
        module: &str,
        function: &str,
        params: FunctionParams,
    ) -> Result<FunctionResult> {
        self.execute_function_with(module, function, params, ExecutionOptions::default())
            .await
    }

    /// 执行模块导出函数，附带编译位置与 DOM 句柄
    ///
    /// 参数校验失败与前置条件不满足时直接返回错误，其余失败作为故障交给故障处理器；
    /// 故障被恢复时重试一次。
    #[instrument(skip(self, params, options))]
    pub async fn execute_function_with(
        &self,
        module: &str,
        function: &str,
        params: FunctionParams,
        options: ExecutionOptions,
    ) -> Result<FunctionResult> {
        let error = match self.execute_once(module, function, params.clone(), &options).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        if matches!(
            error,
            CjmodError::ModuleNotLoaded(_)
                | CjmodError::ModuleNotActive { .. }
                | CjmodError::FunctionNotFound { .. }
                | CjmodError::InvalidParameters { .. }
        ) {
            return Err(error);
        }

        let fault = ModuleFault::from_error(module, &error);
        if fault.is_time_limit() {
            self.record_timeout(module, &fault);
            self.faults.log_fault(&fault);
            return Err(CjmodError::Fault(fault));
        }

        match self.faults.report(&fault).await {
            FaultOutcome::Recovered { strategy } => {
                info!(module = %module, function = %function, strategy = %strategy, "故障已恢复，重试调用");
                self.execute_once(module, function, params, &options)
                    .await
                    .map_err(|e| CjmodError::Fault(ModuleFault::from_error(module, &e)))
            }
            FaultOutcome::Unrecovered | FaultOutcome::Unloaded => Err(CjmodError::Fault(fault)),
        }
    }

    async fn execute_once(
        &self,
        module: &str,
        function: &str,
        mut params: FunctionParams,
        options: &ExecutionOptions,
    ) -> Result<FunctionResult> {
        let (instance, link, resource_root) = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            let entry = registry
                .get(module)
                .ok_or_else(|| CjmodError::ModuleNotLoaded(module.to_string()))?;
            if !entry.module.state.is_active() {
                return Err(CjmodError::ModuleNotActive {
                    module: module.to_string(),
                    state: entry.module.state,
                });
            }
            let source = &entry.module.source_path;
            let root = if source.is_dir() {
                source.clone()
            } else {
                source.parent().map(PathBuf::from).unwrap_or_default()
            };
            (Arc::clone(&entry.instance), Arc::clone(&entry.link), root)
        };

        let signature = instance
            .function(function)
            .ok_or_else(|| CjmodError::FunctionNotFound {
                module: module.to_string(),
                function: function.to_string(),
            })?;
        let problems = instance.validate_parameters(function, &params);
        if !problems.is_empty() {
            return Err(CjmodError::InvalidParameters {
                function: function.to_string(),
                problems,
            });
        }
        signature.apply_defaults(&mut params);

        let cache_key = match &self.cache {
            Some(_) if signature.is_cacheable() => {
                Some(CacheKey::new(module, link.version(), function, &params))
            }
            _ => None,
        };
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(hit) = cache.get(key) {
                debug!(module = %module, function = %function, "命中函数缓存");
                return Ok(hit);
            }
        }

        let sandbox = self.enforcer.create_context(module);
        let scope = self.enforcer.invocation_group(module);
        let invoker: Weak<dyn ModuleInvoker> = self.this.clone();
        let context = ExecutionContext::new(
            link,
            Arc::clone(&sandbox),
            Arc::clone(&self.state),
            Arc::clone(&scope),
        )
        .with_invoker(invoker)
        .with_resource_root(resource_root)
        .with_compilation(options.compilation.clone())
        .with_dom(options.dom.clone());

        let span = crate::execution_span!(module, function, context.execution_id());
        let function_name = function.to_string();
        let result = self
            .enforcer
            .run_isolated(
                &sandbox,
                &scope,
                async move { instance.execute(&function_name, params, &context).await }
                    .instrument(span),
            )
            .await?;

        if let Some(entry) = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(module)
        {
            entry.consecutive_timeouts = 0;
        }
        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            cache.put(key, result.clone());
        }
        Ok(result)
    }

    fn record_timeout(&self, module: &str, fault: &ModuleFault) {
        let exceeded = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            match registry.get_mut(module) {
                Some(entry) => {
                    entry.consecutive_timeouts += 1;
                    warn!(
                        module = %module,
                        consecutive = entry.consecutive_timeouts,
                        threshold = self.timeout_error_threshold,
                        "函数执行超时"
                    );
                    entry.consecutive_timeouts >= self.timeout_error_threshold
                }
                None => false,
            }
        };
        if exceeded {
            let escalated = fault.clone().with_level(ErrorLevel::Critical).with_cause(format!(
                "连续 {} 次执行超时",
                self.timeout_error_threshold
            ));
            self.mark_error(module, &escalated);
        }
    }

    // ==================== 挂起与恢复 ====================

    /// 挂起模块，先挂起所有处于活动状态的依赖方
    pub async fn suspend_module(&self, name: &str) -> Result<LoadedModule> {
        if !self.is_loaded(name) {
            return Err(CjmodError::ModuleNotLoaded(name.to_string()));
        }
        for dependent in self.dependents_of(name) {
            if self.module_state(&dependent) == Some(ModuleState::Active) {
                self.transition(&dependent, ModuleState::Suspended)?;
            }
        }
        let module = self.transition(name, ModuleState::Suspended)?;
        info!(module = %name, "模块已挂起");
        Ok(module)
    }

    /// 恢复模块，要求必需依赖均处于活动状态
    pub async fn resume_module(&self, name: &str) -> Result<LoadedModule> {
        let dependencies = self
            .graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dependencies(name);
        for dependency in dependencies {
            match self.module_state(&dependency) {
                Some(ModuleState::Active) => {}
                Some(state) => {
                    return Err(CjmodError::ModuleNotActive {
                        module: dependency,
                        state,
                    })
                }
                None => return Err(CjmodError::ModuleNotLoaded(dependency)),
            }
        }
        let module = self.transition(name, ModuleState::Active)?;
        info!(module = %name, "模块已恢复");
        Ok(module)
    }

    // ==================== 卸载 ====================

    /// 卸载模块，级联卸载以其为必需依赖的模块
    #[instrument(skip(self))]
    pub async fn unload_module(&self, name: &str) -> Result<()> {
        if !self.is_loaded(name) {
            return Err(CjmodError::ModuleNotLoaded(name.to_string()));
        }
        if self.module_state(name) == Some(ModuleState::Active) {
            self.transition(name, ModuleState::Suspended)?;
        }

        let dependents = self.dependents_of(name);
        if !dependents.is_empty() {
            info!(module = %name, dependents = ?dependents, "级联卸载依赖方");
        }
        for dependent in dependents {
            self.unload_single(&dependent).await;
        }
        self.unload_single(name).await;
        Ok(())
    }

    async fn unload_single(&self, name: &str) {
        if !self
            .unloading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string())
        {
            return;
        }

        let instance = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry.get(name).map(|entry| Arc::clone(&entry.instance))
        };
        if let Some(instance) = instance {
            if self.module_state(name) == Some(ModuleState::Active) {
                let _ = self.transition(name, ModuleState::Suspended);
            }
            let aborted = self.enforcer.abort_module(name);
            if aborted > 0 {
                debug!(module = %name, aborted, "已中止模块任务");
            }
            if let Err(e) = instance.cleanup().await {
                warn!(module = %name, error = %e, "模块清理失败");
                self.faults.log_error(
                    name,
                    ErrorLevel::Warning,
                    ErrorCategory::Execution,
                    format!("模块清理失败: {}", e),
                    None,
                );
            }

            let _ = self.transition(name, ModuleState::Unloaded);
            self.registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name);
            self.graph
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove_module(name);
            if let Some(cache) = &self.cache {
                cache.invalidate_module(name);
            }
            self.state.clear_module(name);
            info!(module = %name, "模块已卸载");
        }

        self.unloading
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// 重新加载：卸载后加载
    #[instrument(skip(self))]
    pub async fn reload_module(&self, name: &str) -> Result<LoadedModule> {
        if self.is_loaded(name) {
            self.unload_module(name).await?;
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_module(name);
        }
        self.load_module(name).await
    }

    /// 按依赖方优先的顺序卸载全部模块
    pub async fn shutdown(&self) {
        let order = {
            let graph = self.graph.read().unwrap_or_else(PoisonError::into_inner);
            graph.unload_order().unwrap_or_else(|_| graph.modules())
        };
        info!(count = order.len(), "卸载全部模块");
        for name in order {
            self.unload_single(&name).await;
        }

        let remaining: Vec<String> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for name in remaining {
            self.unload_single(&name).await;
        }
    }
}

#[async_trait]
impl ModuleController for LifecycleManager {
    async fn reload_module(&self, module: &str) -> Result<()> {
        LifecycleManager::reload_module(self, module).await.map(|_| ())
    }

    async fn unload_module(&self, module: &str) -> Result<()> {
        if !self.is_loaded(module) {
            return Ok(());
        }
        LifecycleManager::unload_module(self, module).await
    }

    async fn release_resources(&self, module: &str) -> Result<()> {
        if let Some(cache) = &self.cache {
            let released = cache.invalidate_module(module);
            debug!(module = %module, released, "已释放缓存结果");
        }
        Ok(())
    }
}

#[async_trait]
impl ModuleInvoker for LifecycleManager {
    async fn invoke(
        &self,
        caller: &str,
        module: &str,
        function: &str,
        params: FunctionParams,
    ) -> Result<FunctionResult> {
        debug!(caller = %caller, module = %module, function = %function, "跨模块调用");
        self.execute_function(module, function, params).await
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("modules", &self.module_count())
            .field("loaders", &self.loaders)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FaultConfig;
    use crate::module::loader::ModuleLoader;
    use crate::module::metadata::{Dependency, FunctionSignature, ModuleDescriptor, Parameter};
    use crate::module::repository::InstalledModule;
    use crate::module::version::ModuleVersion;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Hooks {
        cleaned: AtomicUsize,
        init_calls: AtomicUsize,
        /// 剩余的初始化失败次数
        init_failures: AtomicUsize,
    }

    struct Greeter {
        hooks: Arc<Hooks>,
    }

    #[async_trait]
    impl CjmodModule for Greeter {
        fn functions(&self) -> Vec<FunctionSignature> {
            vec![
                FunctionSignature::new(
                    "greet",
                    vec![
                        Parameter::required("name", "string"),
                        Parameter::optional("punctuation", "string", Some(json!("!"))),
                    ],
                ),
                FunctionSignature::new("fail", Vec::new()),
                FunctionSignature::new("call", Vec::new()),
            ]
        }

        async fn execute(
            &self,
            function: &str,
            params: FunctionParams,
            context: &ExecutionContext,
        ) -> Result<FunctionResult> {
            match function {
                "greet" => Ok(FunctionResult::new(json!(format!(
                    "hello {}{}",
                    params["name"].as_str().unwrap_or_default(),
                    params["punctuation"].as_str().unwrap_or_default()
                )))),
                "call" => {
                    let target = params["target"].as_str().unwrap_or_default().to_string();
                    context.call_module(&target, "greet", params).await
                }
                _ => Err(CjmodError::Internal("boom".to_string())),
            }
        }

        async fn initialize(&self, _context: &InitContext) -> Result<()> {
            self.hooks.init_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .hooks
                .init_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(CjmodError::Internal("配置尚未就绪".to_string()));
            }
            Ok(())
        }

        async fn cleanup(&self) -> Result<()> {
            self.hooks.cleaned.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// 按路径文件名实例化的测试加载器
    struct StubLoader {
        descriptors: HashMap<String, ModuleDescriptor>,
        hooks: Arc<Hooks>,
    }

    #[async_trait]
    impl ModuleLoader for StubLoader {
        fn loader_type(&self) -> &'static str {
            "stub"
        }

        fn can_load(&self, _path: &Path) -> bool {
            true
        }

        async fn read_descriptor(&self, path: &Path) -> Result<ModuleDescriptor> {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            self.descriptors
                .get(name)
                .cloned()
                .ok_or_else(|| CjmodError::MissingManifest(path.to_path_buf()))
        }

        async fn load(&self, path: &Path) -> Result<LoadedArtifact> {
            let descriptor = self.read_descriptor(path).await?;
            Ok(LoadedArtifact {
                module: LoadedModule::new(descriptor, path, "stub"),
                instance: Arc::new(Greeter {
                    hooks: Arc::clone(&self.hooks),
                }),
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl LifecycleListener for Recorder {
        fn on_activated(&self, module: &LoadedModule) {
            self.events.lock().unwrap().push(format!("activated:{}", module.name()));
        }

        fn on_unloaded(&self, module: &LoadedModule) {
            self.events.lock().unwrap().push(format!("unloaded:{}", module.name()));
        }
    }

    async fn manager(hooks: Arc<Hooks>) -> Arc<LifecycleManager> {
        let base = ModuleDescriptor::new("base", ModuleVersion::new(1, 0, 0), "greeter");
        let app = ModuleDescriptor::new("app", ModuleVersion::new(1, 0, 0), "greeter")
            .with_dependency(Dependency::new("base", VersionRange::parse("^1.0.0").unwrap()));

        let repository = Arc::new(ModuleRepository::new("unused", Vec::new()));
        let mut descriptors = HashMap::new();
        for descriptor in [base, app] {
            repository
                .register(InstalledModule::new(descriptor.clone(), &descriptor.name))
                .await;
            descriptors.insert(descriptor.name.clone(), descriptor);
        }

        let loaders = LoaderChain::new().with_loader(Arc::new(StubLoader { descriptors, hooks }));
        LifecycleManager::new(
            LifecycleServices::new(repository, loaders, FaultHandler::new(FaultConfig::default()))
                .with_cache(Arc::new(FunctionCache::new(16, std::time::Duration::from_secs(60)))),
        )
    }

    #[tokio::test]
    async fn test_load_activates_dependencies_first() {
        let lifecycle = manager(Arc::default()).await;
        let recorder = Arc::new(Recorder::default());
        lifecycle.add_listener(recorder.clone());

        let app = lifecycle.load_module("app").await.unwrap();
        assert_eq!(app.state, ModuleState::Active);
        assert_eq!(lifecycle.module_state("base"), Some(ModuleState::Active));
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["activated:base", "activated:app"]
        );
        assert_eq!(lifecycle.dependents_of("base"), vec!["app"]);
    }

    #[tokio::test]
    async fn test_execute_applies_defaults_and_validates() {
        let lifecycle = manager(Arc::default()).await;
        lifecycle.load_module("base").await.unwrap();

        let mut params = FunctionParams::new();
        params.insert("name".to_string(), json!("chtl"));
        let result = lifecycle.execute_function("base", "greet", params).await.unwrap();
        assert_eq!(result.value, json!("hello chtl!"));

        assert!(matches!(
            lifecycle.execute_function("base", "greet", FunctionParams::new()).await,
            Err(CjmodError::InvalidParameters { .. })
        ));
        assert!(matches!(
            lifecycle.execute_function("base", "missing", FunctionParams::new()).await,
            Err(CjmodError::FunctionNotFound { .. })
        ));
        assert!(matches!(
            lifecycle.execute_function("ghost", "greet", FunctionParams::new()).await,
            Err(CjmodError::ModuleNotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_cross_module_call_follows_link_unit() {
        let lifecycle = manager(Arc::default()).await;
        lifecycle.load_module("app").await.unwrap();

        let mut params = FunctionParams::new();
        params.insert("name".to_string(), json!("app"));
        params.insert("target".to_string(), json!("base"));
        let result = lifecycle.execute_function("app", "call", params.clone()).await.unwrap();
        assert_eq!(result.value, json!("hello app!"));

        // base 的依赖闭包不包含 app
        params.insert("target".to_string(), json!("app"));
        let denied = lifecycle.execute_function("base", "call", params).await;
        match denied {
            Err(CjmodError::Fault(fault)) => assert_eq!(fault.category, ErrorCategory::Security),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_suspend_cascades_and_resume_requires_dependencies() {
        let lifecycle = manager(Arc::default()).await;
        lifecycle.load_module("app").await.unwrap();

        lifecycle.suspend_module("base").await.unwrap();
        assert_eq!(lifecycle.module_state("app"), Some(ModuleState::Suspended));
        assert!(matches!(
            lifecycle.execute_function("app", "greet", FunctionParams::new()).await,
            Err(CjmodError::ModuleNotActive { .. })
        ));

        assert!(matches!(
            lifecycle.resume_module("app").await,
            Err(CjmodError::ModuleNotActive { .. })
        ));
        lifecycle.resume_module("base").await.unwrap();
        lifecycle.resume_module("app").await.unwrap();
        assert_eq!(lifecycle.module_state("app"), Some(ModuleState::Active));
    }

    #[tokio::test]
    async fn test_unload_cascades_and_cleans_up() {
        let hooks = Arc::new(Hooks::default());
        let lifecycle = manager(Arc::clone(&hooks)).await;
        let recorder = Arc::new(Recorder::default());
        lifecycle.load_module("app").await.unwrap();
        let id = lifecycle.add_listener(recorder.clone());

        lifecycle.unload_module("base").await.unwrap();
        assert!(lifecycle.get_all_modules().is_empty());
        assert_eq!(hooks.cleaned.load(Ordering::SeqCst), 2);
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["unloaded:app", "unloaded:base"]
        );
        assert!(lifecycle.remove_listener(&id));
        assert!(matches!(
            lifecycle.unload_module("base").await,
            Err(CjmodError::ModuleNotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_and_shutdown() {
        let hooks = Arc::new(Hooks::default());
        let lifecycle = manager(Arc::clone(&hooks)).await;
        let first = lifecycle.load_module("base").await.unwrap();
        let second = lifecycle.reload_module("base").await.unwrap();
        assert_eq!(second.state, ModuleState::Active);
        assert!(second.load_time >= first.load_time);

        lifecycle.load_module("app").await.unwrap();
        lifecycle.shutdown().await;
        assert_eq!(lifecycle.module_count(), 0);
        assert_eq!(hooks.cleaned.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_module_fails_without_entry() {
        let lifecycle = manager(Arc::default()).await;
        match lifecycle.load_module("ghost").await {
            Err(CjmodError::Fault(fault)) => {
                assert_eq!(fault.category, ErrorCategory::Loading);
                assert_eq!(fault.module, "ghost");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!lifecycle.is_loaded("ghost"));
    }

    #[tokio::test]
    async fn test_load_refuses_suspended_dependency() {
        let lifecycle = manager(Arc::default()).await;
        lifecycle.load_module("base").await.unwrap();
        lifecycle.suspend_module("base").await.unwrap();

        match lifecycle.load_module("app").await {
            Err(CjmodError::Fault(fault)) => assert!(fault.message.contains("base")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_ne!(lifecycle.module_state("app"), Some(ModuleState::Active));
        assert_eq!(lifecycle.module_state("base"), Some(ModuleState::Suspended));

        lifecycle.resume_module("base").await.unwrap();
        let app = lifecycle.load_module("app").await.unwrap();
        assert_eq!(app.state, ModuleState::Active);
    }

    #[tokio::test]
    async fn test_init_fault_recovered_before_returning() {
        let hooks = Arc::new(Hooks::default());
        hooks.init_failures.store(1, Ordering::SeqCst);
        let lifecycle = manager(Arc::clone(&hooks)).await;

        let base = lifecycle.load_module("base").await.unwrap();
        assert_eq!(base.state, ModuleState::Active);
        assert_eq!(hooks.init_calls.load(Ordering::SeqCst), 2);
        // 失败的实例在重载前被清理
        assert_eq!(hooks.cleaned.load(Ordering::SeqCst), 1);

        let stats = lifecycle.fault_handler().statistics("base").unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.recovered, 1);
    }

    #[tokio::test]
    async fn test_persistent_init_fault_fails_load() {
        let hooks = Arc::new(Hooks::default());
        hooks.init_failures.store(usize::MAX, Ordering::SeqCst);
        let lifecycle = manager(Arc::clone(&hooks)).await;

        match lifecycle.load_module("base").await {
            Err(CjmodError::Fault(fault)) => assert_eq!(fault.category, ErrorCategory::Initialization),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!lifecycle.is_loaded("base"));
        assert!(hooks.init_calls.load(Ordering::SeqCst) >= 2);
    }
}
