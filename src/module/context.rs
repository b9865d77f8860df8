//! 执行上下文
//!
//! 运行时在每次函数调用时构造一个 [`ExecutionContext`] 交给模块。模块通过它访问：
//!
//! - 编译位置（文件、行、列、作用域及作用域变量）
//! - 全局和模块私有状态
//! - 日志
//! - 资源读写（经过沙箱文件检查）
//! - 跨模块调用（限于链接单元的依赖闭包）
//! - 任务创建（经过沙箱任务名额检查）
//! - 宿主提供的 DOM 构建器句柄

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::module::metadata::{FunctionParams, FunctionResult};
use crate::module::runtime::LinkUnit;
use crate::module::state::StateStore;
use crate::module::version::ModuleVersion;
use crate::sandbox::{FileAccess, SandboxContext, TaskGroup};
use crate::utils::{generate_execution_id, CjmodError, Result};

/// 宿主代码生成层提供的 DOM 构建器句柄，运行时不解释其内容
pub type DomHandle = Arc<dyn Any + Send + Sync>;

/// 跨模块调用入口
#[async_trait]
pub trait ModuleInvoker: Send + Sync {
    async fn invoke(
        &self,
        caller: &str,
        module: &str,
        function: &str,
        params: FunctionParams,
    ) -> Result<FunctionResult>;
}

/// 编译位置与作用域
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilationContext {
    pub file: Option<PathBuf>,
    pub line: u32,
    pub column: u32,
    pub scope: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

impl CompilationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, file: impl Into<PathBuf>, line: u32, column: u32) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

/// 单次调用的执行上下文
#[derive(Clone)]
pub struct ExecutionContext {
    execution_id: String,
    module: String,
    version: ModuleVersion,
    compilation: CompilationContext,
    state: Arc<StateStore>,
    sandbox: Arc<SandboxContext>,
    link: Arc<LinkUnit>,
    tasks: Arc<TaskGroup>,
    invoker: Option<Weak<dyn ModuleInvoker>>,
    resource_root: PathBuf,
    dom: Option<DomHandle>,
}

impl ExecutionContext {
    pub fn new(
        link: Arc<LinkUnit>,
        sandbox: Arc<SandboxContext>,
        state: Arc<StateStore>,
        tasks: Arc<TaskGroup>,
    ) -> Self {
        Self {
            execution_id: generate_execution_id(link.module()),
            module: link.module().to_string(),
            version: link.version().clone(),
            compilation: CompilationContext::default(),
            state,
            sandbox,
            link,
            tasks,
            invoker: None,
            resource_root: PathBuf::from("."),
            dom: None,
        }
    }

    pub fn with_compilation(mut self, compilation: CompilationContext) -> Self {
        self.compilation = compilation;
        self
    }

    pub fn with_invoker(mut self, invoker: Weak<dyn ModuleInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn with_resource_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.resource_root = root.into();
        self
    }

    pub fn with_dom(mut self, dom: Option<DomHandle>) -> Self {
        self.dom = dom;
        self
    }

    // ==================== 身份 ====================

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn version(&self) -> &ModuleVersion {
        &self.version
    }

    pub fn sandbox(&self) -> &Arc<SandboxContext> {
        &self.sandbox
    }

    pub fn link_unit(&self) -> &LinkUnit {
        &self.link
    }

    pub fn dom(&self) -> Option<&DomHandle> {
        self.dom.as_ref()
    }

    // ==================== 编译位置 ====================

    pub fn compilation(&self) -> &CompilationContext {
        &self.compilation
    }

    pub fn current_file(&self) -> Option<&Path> {
        self.compilation.file.as_deref()
    }

    pub fn current_line(&self) -> u32 {
        self.compilation.line
    }

    pub fn current_column(&self) -> u32 {
        self.compilation.column
    }

    pub fn current_scope(&self) -> &str {
        &self.compilation.scope
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.compilation.variables.get(name)
    }

    // ==================== 状态 ====================

    /// 模块私有状态
    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.state.get_module(&self.module, key)
    }

    pub fn set_state(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state.set_module(&self.module, key, value)
    }

    pub fn has_state(&self, key: &str) -> bool {
        self.state.has_module(&self.module, key)
    }

    /// 全局状态
    pub fn get_global(&self, key: &str) -> Option<Value> {
        self.state.get_global(key)
    }

    pub fn set_global(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state.set_global(key, value, &self.module)
    }

    pub fn has_global(&self, key: &str) -> bool {
        self.state.has_global(key)
    }

    // ==================== 日志 ====================

    pub fn log(&self, message: &str) {
        tracing::info!(module = %self.module, execution_id = %self.execution_id, "[{}] {}", self.module, message);
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(module = %self.module, execution_id = %self.execution_id, "[{}] {}", self.module, message);
    }

    pub fn warning(&self, message: &str) {
        tracing::warn!(module = %self.module, execution_id = %self.execution_id, "[{}] {}", self.module, message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(module = %self.module, execution_id = %self.execution_id, "[{}] {}", self.module, message);
    }

    // ==================== 沙箱操作 ====================

    /// 协作式取消检查点
    pub fn checkpoint(&self) -> Result<()> {
        self.sandbox.check_time()
    }

    fn resolve_resource(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.resource_root.join(path)
        }
    }

    /// 读取资源，相对路径基于模块目录
    pub async fn load_resource(&self, path: &str) -> Result<Vec<u8>> {
        let resolved = self.resolve_resource(path);
        self.sandbox.check_file_access(&resolved, FileAccess::Read)?;
        Ok(tokio::fs::read(&resolved).await?)
    }

    pub async fn load_resource_string(&self, path: &str) -> Result<String> {
        let bytes = self.load_resource(path).await?;
        String::from_utf8(bytes).map_err(|e| CjmodError::Internal(format!("资源不是有效的 UTF-8: {}", e)))
    }

    /// 写入资源
    pub async fn save_resource(&self, path: &str, content: &[u8]) -> Result<()> {
        let resolved = self.resolve_resource(path);
        self.sandbox.check_file_access(&resolved, FileAccess::Write)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, content).await?;
        Ok(())
    }

    /// 读取系统属性
    pub fn system_property(&self, key: &str) -> Result<Option<String>> {
        self.sandbox.read_system_property(key)
    }

    /// 在本次调用的任务组中创建任务
    ///
    /// 调用返回或超时后任务被中止。
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.sandbox.acquire_thread()?;
        Ok(self.tasks.spawn(async move {
            let _permit = permit;
            future.await
        }))
    }

    /// 调用其他模块的导出函数，目标必须在依赖闭包内
    pub async fn call_module(
        &self,
        module: &str,
        function: &str,
        params: FunctionParams,
    ) -> Result<FunctionResult> {
        self.sandbox.check_time()?;
        self.link.check_link(module)?;

        let invoker = self
            .invoker
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| CjmodError::Internal("跨模块调用不可用：运行时已关闭".to_string()))?;
        invoker.invoke(&self.module, module, function, params).await
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("module", &self.module)
            .field("version", &self.version)
            .field("compilation", &self.compilation)
            .finish()
    }
}
