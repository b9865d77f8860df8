//! 模块运行时契约
//!
//! - [`CjmodModule`] - 模块实现需要提供的接口：导出函数签名、初始化、执行、清理
//! - [`ModuleFactoryRegistry`] - 入口点标识到模块工厂的符号表，加载器通过它实例化模块
//! - [`LinkUnit`] - 模块的链接单元，记录声明的依赖闭包，跨模块调用只能落在闭包内

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::module::context::ExecutionContext;
use crate::module::metadata::{FunctionParams, FunctionResult, FunctionSignature};
use crate::module::version::ModuleVersion;
use crate::sandbox::SandboxContext;
use crate::utils::{CjmodError, Result};

/// 初始化上下文
///
/// 初始化在沙箱内进行，模块的敏感操作需经过 [`InitContext::sandbox`] 检查。
#[derive(Debug, Clone)]
pub struct InitContext {
    module: String,
    settings: HashMap<String, Value>,
    sandbox: Arc<SandboxContext>,
}

impl InitContext {
    pub fn new(
        module: impl Into<String>,
        settings: HashMap<String, Value>,
        sandbox: Arc<SandboxContext>,
    ) -> Self {
        Self {
            module: module.into(),
            settings,
            sandbox,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// 模块配置项
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    pub fn settings(&self) -> &HashMap<String, Value> {
        &self.settings
    }

    pub fn sandbox(&self) -> &Arc<SandboxContext> {
        &self.sandbox
    }
}

/// CJMOD 模块接口
///
/// 实现需要是 `Send + Sync`，状态通过内部可变性维护。
#[async_trait]
pub trait CjmodModule: Send + Sync {
    /// 导出函数签名
    fn functions(&self) -> Vec<FunctionSignature>;

    /// 按名称查找导出函数
    fn function(&self, name: &str) -> Option<FunctionSignature> {
        self.functions().into_iter().find(|f| f.name == name)
    }

    /// 参数校验，返回全部问题
    ///
    /// 默认实现报告函数不存在以及缺少无默认值的必需参数。
    fn validate_parameters(&self, function: &str, params: &FunctionParams) -> Vec<String> {
        let Some(signature) = self.function(function) else {
            return vec![format!("函数不存在: {}", function)];
        };
        signature
            .parameters
            .iter()
            .filter(|p| p.required && p.default_value.is_none() && !params.contains_key(&p.name))
            .map(|p| format!("缺少必需参数: {}", p.name))
            .collect()
    }

    /// 初始化
    async fn initialize(&self, _context: &InitContext) -> Result<()> {
        Ok(())
    }

    /// 执行导出函数
    async fn execute(
        &self,
        function: &str,
        params: FunctionParams,
        context: &ExecutionContext,
    ) -> Result<FunctionResult>;

    /// 清理资源
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

// ==================== 符号表 ====================

/// 模块工厂
pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn CjmodModule> + Send + Sync>;

/// 入口点符号表
///
/// 宿主在启动时把所有可用的入口点注册进来，清单中的 `entryPoint` 在这里解析。
#[derive(Default)]
pub struct ModuleFactoryRegistry {
    factories: RwLock<HashMap<String, ModuleFactory>>,
}

impl ModuleFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册入口点，已存在时替换
    pub fn register<F, M>(&self, entry_point: impl Into<String>, factory: F)
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: CjmodModule + 'static,
    {
        let factory: ModuleFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn CjmodModule>);
        self.register_factory(entry_point, factory);
    }

    pub fn register_factory(&self, entry_point: impl Into<String>, factory: ModuleFactory) {
        let entry_point = entry_point.into();
        tracing::debug!(entry_point = %entry_point, "注册模块入口点");
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry_point, factory);
    }

    pub fn unregister(&self, entry_point: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(entry_point)
            .is_some()
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(entry_point)
    }

    /// 全部入口点（已排序）
    pub fn entry_points(&self) -> Vec<String> {
        let mut entries: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        entries.sort();
        entries
    }

    /// 实例化模块
    ///
    /// # 错误
    ///
    /// 入口点未注册时返回 `CjmodError::EntryPoint`。
    pub fn instantiate(&self, module: &str, entry_point: &str) -> Result<Arc<dyn CjmodModule>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry_point)
            .cloned()
            .ok_or_else(|| CjmodError::EntryPoint {
                module: module.to_string(),
                entry_point: entry_point.to_string(),
            })?;
        Ok(factory())
    }
}

impl fmt::Debug for ModuleFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleFactoryRegistry")
            .field("entry_points", &self.entry_points())
            .finish()
    }
}

// ==================== 链接单元 ====================

/// 模块链接单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkUnit {
    module: String,
    version: ModuleVersion,
    entry_point: String,
    dependencies: BTreeSet<String>,
    classpath: Vec<PathBuf>,
}

impl LinkUnit {
    pub fn new(module: impl Into<String>, version: ModuleVersion, entry_point: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            version,
            entry_point: entry_point.into(),
            dependencies: BTreeSet::new(),
            classpath: Vec::new(),
        }
    }

    /// 设置依赖闭包（含传递依赖）
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self.dependencies.remove(&self.module);
        self
    }

    pub fn with_classpath(mut self, classpath: Vec<PathBuf>) -> Self {
        self.classpath = classpath;
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn version(&self) -> &ModuleVersion {
        &self.version
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn classpath(&self) -> &[PathBuf] {
        &self.classpath
    }

    /// 是否可以链接到目标模块
    pub fn can_link(&self, target: &str) -> bool {
        target == self.module || self.dependencies.contains(target)
    }

    /// 链接检查，失败时返回安全类错误
    pub fn check_link(&self, target: &str) -> Result<()> {
        if self.can_link(target) {
            Ok(())
        } else {
            Err(CjmodError::PermissionDenied {
                module: self.module.clone(),
                operation: format!("link {}", target),
                reason: "目标模块不在声明的依赖闭包中".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::metadata::Parameter;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl CjmodModule for Echo {
        fn functions(&self) -> Vec<FunctionSignature> {
            vec![FunctionSignature::new(
                "echo",
                vec![
                    Parameter::required("text", "string"),
                    Parameter::optional("times", "number", Some(json!(1))),
                ],
            )]
        }

        async fn execute(
            &self,
            _function: &str,
            params: FunctionParams,
            _context: &ExecutionContext,
        ) -> Result<FunctionResult> {
            Ok(FunctionResult::new(params.get("text").cloned().unwrap_or(Value::Null)))
        }
    }

    #[test]
    fn test_default_parameter_validation() {
        let module = Echo;
        let mut params = FunctionParams::new();
        assert_eq!(module.validate_parameters("echo", &params), vec!["缺少必需参数: text"]);

        params.insert("text".to_string(), json!("hi"));
        assert!(module.validate_parameters("echo", &params).is_empty());
        assert_eq!(module.validate_parameters("nope", &params).len(), 1);
    }

    #[test]
    fn test_factory_registry() {
        let registry = ModuleFactoryRegistry::new();
        registry.register("echo::Module", || Echo);

        assert!(registry.contains("echo::Module"));
        assert_eq!(registry.entry_points(), vec!["echo::Module"]);
        let instance = registry.instantiate("echo", "echo::Module").unwrap();
        assert_eq!(instance.functions().len(), 1);

        assert!(matches!(
            registry.instantiate("echo", "missing::Module"),
            Err(CjmodError::EntryPoint { .. })
        ));
        assert!(registry.unregister("echo::Module"));
        assert!(!registry.contains("echo::Module"));
    }

    #[test]
    fn test_link_unit() {
        let unit = LinkUnit::new("app", ModuleVersion::new(1, 0, 0), "app::Entry")
            .with_dependencies(["ui", "core", "app"]);

        assert!(unit.can_link("app"));
        assert!(unit.can_link("core"));
        assert!(!unit.dependencies().contains("app"));
        assert!(matches!(
            unit.check_link("stranger"),
            Err(CjmodError::PermissionDenied { .. })
        ));
    }
}
