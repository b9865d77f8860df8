//! CJMOD 运行时错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型，以及错误到故障分类（类别、级别、错误码）的映射。

use std::path::PathBuf;

use thiserror::Error;

use crate::fault::{ErrorCategory, ErrorLevel, ModuleFault};
use crate::module::metadata::ModuleState;

/// CJMOD 运行时核心错误类型
#[derive(Error, Debug)]
pub enum CjmodError {
    // ==================== 版本错误 ====================

    /// 版本号格式错误
    #[error("版本号格式错误: '{0}'")]
    MalformedVersion(String),

    /// 版本范围格式错误
    #[error("版本范围格式错误: '{range}' - {reason}")]
    InvalidRange {
        range: String,
        reason: String,
    },

    // ==================== 模块加载错误 ====================

    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// 没有加载器能够处理该路径
    #[error("不支持的模块: {0:?}")]
    UnsupportedModule(PathBuf),

    /// 模块包中缺少清单
    #[error("模块清单缺失: {0:?}")]
    MissingManifest(PathBuf),

    /// 清单内容无效
    #[error("无效的模块清单: {0}")]
    InvalidManifest(String),

    /// 入口点无法解析
    #[error("模块 '{module}' 的入口点 '{entry_point}' 无法解析")]
    EntryPoint {
        module: String,
        entry_point: String,
    },

    /// 目录模块构建失败
    #[error("模块 '{module}' 构建失败 (退出码 {exit_code:?}): {message}")]
    BuildFailure {
        module: String,
        exit_code: Option<i32>,
        message: String,
    },

    // ==================== 生命周期错误 ====================

    /// 模块未加载
    #[error("模块未加载: '{0}'")]
    ModuleNotLoaded(String),

    /// 模块未处于活动状态
    #[error("模块 '{module}' 未处于活动状态，当前状态: {state:?}")]
    ModuleNotActive {
        module: String,
        state: ModuleState,
    },

    /// 非法的状态转换
    #[error("模块 '{module}' 不允许从 {from:?} 转换到 {to:?}")]
    InvalidStateTransition {
        module: String,
        from: ModuleState,
        to: ModuleState,
    },

    /// 导出函数不存在
    #[error("模块 '{module}' 未导出函数 '{function}'")]
    FunctionNotFound {
        module: String,
        function: String,
    },

    /// 参数校验失败
    #[error("函数 '{function}' 参数无效: {problems:?}")]
    InvalidParameters {
        function: String,
        problems: Vec<String>,
    },

    // ==================== 依赖错误 ====================

    /// 依赖解析失败
    #[error("模块 '{module}' 依赖解析失败: {errors:?}")]
    DependencyResolution {
        module: String,
        errors: Vec<String>,
    },

    /// 循环依赖
    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),

    // ==================== 沙箱错误 ====================

    /// 沙箱拒绝了敏感操作
    #[error("模块 '{module}' 无权执行 {operation}: {reason}")]
    PermissionDenied {
        module: String,
        operation: String,
        reason: String,
    },

    /// 超出 CPU 时间限制
    #[error("模块 '{module}' 超出执行时间限制 {limit_ms}ms")]
    TimeLimitExceeded {
        module: String,
        limit_ms: u64,
    },

    /// 超出资源配额
    #[error("模块 '{module}' 超出资源配额 {resource}: 上限 {limit}")]
    QuotaExceeded {
        module: String,
        resource: String,
        limit: u64,
    },

    // ==================== 故障 ====================

    /// 经过故障处理器分类的模块故障
    #[error("{0}")]
    Fault(ModuleFault),

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        key: String,
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 正则表达式错误
    #[error("正则表达式错误: {0}")]
    Regex(#[from] regex::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 操作被取消
    #[error("操作被取消")]
    Cancelled,

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, CjmodError>;

/// 错误码常量
pub mod error_code {
    // 版本错误 (VERSION-xxx)
    pub const VERSION_MALFORMED: &str = "VERSION-001";
    pub const VERSION_INVALID_RANGE: &str = "VERSION-002";

    // 模块错误 (MODULE-xxx)
    pub const MODULE_NOT_FOUND: &str = "MODULE-001";
    pub const MODULE_NOT_LOADED: &str = "MODULE-002";
    pub const MODULE_NOT_ACTIVE: &str = "MODULE-003";
    pub const MODULE_UNSUPPORTED: &str = "MODULE-004";
    pub const MODULE_MISSING_MANIFEST: &str = "MODULE-005";
    pub const MODULE_INVALID_MANIFEST: &str = "MODULE-006";
    pub const MODULE_ENTRY_POINT: &str = "MODULE-007";
    pub const MODULE_BUILD_FAILURE: &str = "MODULE-008";
    pub const MODULE_INVALID_TRANSITION: &str = "MODULE-009";

    // 执行错误 (EXEC-xxx)
    pub const EXEC_FUNCTION_NOT_FOUND: &str = "EXEC-001";
    pub const EXEC_INVALID_PARAMETERS: &str = "EXEC-002";
    pub const EXEC_FAILED: &str = "EXEC-003";

    // 依赖错误 (DEPENDENCY-xxx)
    pub const DEPENDENCY_RESOLUTION: &str = "DEPENDENCY-001";
    pub const DEPENDENCY_CIRCULAR: &str = "DEPENDENCY-002";

    // 沙箱错误 (SANDBOX-xxx)
    pub const SANDBOX_PERMISSION_DENIED: &str = "SANDBOX-001";
    pub const SANDBOX_TIME_LIMIT: &str = "SANDBOX-002";
    pub const SANDBOX_QUOTA_EXCEEDED: &str = "SANDBOX-003";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 资源错误 (RESOURCE-xxx)
    pub const RESOURCE_IO: &str = "RESOURCE-001";
    pub const RESOURCE_FORMAT: &str = "RESOURCE-002";

    // 内部错误 (INTERNAL-xxx)
    pub const INTERNAL: &str = "INTERNAL-001";
    pub const INTERNAL_CANCELLED: &str = "INTERNAL-002";
}

impl CjmodError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CjmodError::MalformedVersion(_) => error_code::VERSION_MALFORMED,
            CjmodError::InvalidRange { .. } => error_code::VERSION_INVALID_RANGE,
            CjmodError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CjmodError::UnsupportedModule(_) => error_code::MODULE_UNSUPPORTED,
            CjmodError::MissingManifest(_) => error_code::MODULE_MISSING_MANIFEST,
            CjmodError::InvalidManifest(_) => error_code::MODULE_INVALID_MANIFEST,
            CjmodError::EntryPoint { .. } => error_code::MODULE_ENTRY_POINT,
            CjmodError::BuildFailure { .. } => error_code::MODULE_BUILD_FAILURE,
            CjmodError::ModuleNotLoaded(_) => error_code::MODULE_NOT_LOADED,
            CjmodError::ModuleNotActive { .. } => error_code::MODULE_NOT_ACTIVE,
            CjmodError::InvalidStateTransition { .. } => error_code::MODULE_INVALID_TRANSITION,
            CjmodError::FunctionNotFound { .. } => error_code::EXEC_FUNCTION_NOT_FOUND,
            CjmodError::InvalidParameters { .. } => error_code::EXEC_INVALID_PARAMETERS,
            CjmodError::DependencyResolution { .. } => error_code::DEPENDENCY_RESOLUTION,
            CjmodError::CircularDependency(_) => error_code::DEPENDENCY_CIRCULAR,
            CjmodError::PermissionDenied { .. } => error_code::SANDBOX_PERMISSION_DENIED,
            CjmodError::TimeLimitExceeded { .. } => error_code::SANDBOX_TIME_LIMIT,
            CjmodError::QuotaExceeded { .. } => error_code::SANDBOX_QUOTA_EXCEEDED,
            CjmodError::Fault(fault) => fault.code,
            CjmodError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CjmodError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            CjmodError::Io(_) => error_code::RESOURCE_IO,
            CjmodError::Json(_) | CjmodError::Yaml(_) | CjmodError::Regex(_) => {
                error_code::RESOURCE_FORMAT
            }
            CjmodError::Cancelled => error_code::INTERNAL_CANCELLED,
            CjmodError::Other(_) => error_code::EXEC_FAILED,
            CjmodError::Internal(_) | CjmodError::InitFailed(_) => error_code::INTERNAL,
        }
    }

    /// 获取故障类别
    pub fn category(&self) -> ErrorCategory {
        match self {
            CjmodError::MalformedVersion(_)
            | CjmodError::InvalidRange { .. }
            | CjmodError::InvalidManifest(_)
            | CjmodError::ConfigLoadFailed(_)
            | CjmodError::InvalidConfigValue { .. } => ErrorCategory::Configuration,
            CjmodError::ModuleNotFound(_)
            | CjmodError::UnsupportedModule(_)
            | CjmodError::MissingManifest(_)
            | CjmodError::EntryPoint { .. }
            | CjmodError::BuildFailure { .. } => ErrorCategory::Loading,
            CjmodError::DependencyResolution { .. } | CjmodError::CircularDependency(_) => {
                ErrorCategory::Dependency
            }
            CjmodError::PermissionDenied { .. } => ErrorCategory::Security,
            CjmodError::QuotaExceeded { .. } | CjmodError::Io(_) => ErrorCategory::Resource,
            CjmodError::ModuleNotLoaded(_)
            | CjmodError::ModuleNotActive { .. }
            | CjmodError::FunctionNotFound { .. }
            | CjmodError::InvalidParameters { .. }
            | CjmodError::TimeLimitExceeded { .. }
            | CjmodError::Other(_) => ErrorCategory::Execution,
            CjmodError::Json(_) | CjmodError::Yaml(_) => ErrorCategory::Communication,
            CjmodError::InitFailed(_) => ErrorCategory::Initialization,
            CjmodError::Fault(fault) => fault.category,
            CjmodError::InvalidStateTransition { .. }
            | CjmodError::Regex(_)
            | CjmodError::Internal(_)
            | CjmodError::Cancelled => ErrorCategory::Internal,
        }
    }

    /// 获取默认故障级别
    pub fn default_level(&self) -> ErrorLevel {
        match self {
            CjmodError::Fault(fault) => fault.level,
            CjmodError::InvalidParameters { .. } | CjmodError::FunctionNotFound { .. } => {
                ErrorLevel::Warning
            }
            CjmodError::Cancelled => ErrorLevel::Info,
            CjmodError::Internal(_) => ErrorLevel::Critical,
            _ => ErrorLevel::Error,
        }
    }

    /// 如果是故障，返回故障详情
    pub fn as_fault(&self) -> Option<&ModuleFault> {
        match self {
            CjmodError::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    /// 是否为权限拒绝
    pub fn is_security_violation(&self) -> bool {
        self.category() == ErrorCategory::Security
    }
}

impl From<ModuleFault> for CjmodError {
    fn from(fault: ModuleFault) -> Self {
        CjmodError::Fault(fault)
    }
}
