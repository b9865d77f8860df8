//! 故障分类与恢复
//!
//! 运行时中的所有故障都按两个相互独立的维度分类：
//!
//! - [`ErrorLevel`]：严重程度，`Debug < Info < Warning < Error < Critical < Fatal`
//! - [`ErrorCategory`]：故障来源，例如初始化、加载、执行、安全等
//!
//! [`FaultHandler`] 负责记录、统计、通知监听器并调度恢复策略。

pub mod handler;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::error::CjmodError;
use crate::utils::id::generate_id;

pub use handler::{
    DependencyResolutionStrategy, FaultHandler, FaultListener, FaultOutcome, GlobalStatistics,
    ModuleController, RecoveryStrategy, ReleaseResourcesStrategy, ReloadModuleStrategy,
};

// ==================== 级别与类别 ====================

/// 故障级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorLevel {
    /// 调试信息
    Debug,
    /// 信息
    Info,
    /// 警告
    Warning,
    /// 错误
    Error,
    /// 严重错误
    Critical,
    /// 致命错误，总会导致模块卸载
    Fatal,
}

impl ErrorLevel {
    /// 全部级别，按严重程度升序
    pub const ALL: [ErrorLevel; 6] = [
        ErrorLevel::Debug,
        ErrorLevel::Info,
        ErrorLevel::Warning,
        ErrorLevel::Error,
        ErrorLevel::Critical,
        ErrorLevel::Fatal,
    ];

    /// 数值严重度（0-5）
    pub fn severity(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorLevel::Debug => "DEBUG",
            ErrorLevel::Info => "INFO",
            ErrorLevel::Warning => "WARNING",
            ErrorLevel::Error => "ERROR",
            ErrorLevel::Critical => "CRITICAL",
            ErrorLevel::Fatal => "FATAL",
        };
        write!(f, "{}", s)
    }
}

/// 故障类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorCategory {
    /// 初始化错误
    Initialization,
    /// 加载错误
    Loading,
    /// 执行错误
    Execution,
    /// 安全错误
    Security,
    /// 资源错误
    Resource,
    /// 依赖错误
    Dependency,
    /// 配置错误
    Configuration,
    /// 通信错误
    Communication,
    /// 内部错误
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Initialization => "INITIALIZATION",
            ErrorCategory::Loading => "LOADING",
            ErrorCategory::Execution => "EXECUTION",
            ErrorCategory::Security => "SECURITY",
            ErrorCategory::Resource => "RESOURCE",
            ErrorCategory::Dependency => "DEPENDENCY",
            ErrorCategory::Configuration => "CONFIGURATION",
            ErrorCategory::Communication => "COMMUNICATION",
            ErrorCategory::Internal => "INTERNAL",
        };
        write!(f, "{}", s)
    }
}

// ==================== 故障记录 ====================

/// 一条故障记录
///
/// 由任意组件在发生故障时创建，交给 [`FaultHandler`] 处理。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// 记录 ID
    pub id: String,
    /// 模块名
    pub module: String,
    /// 级别
    pub level: ErrorLevel,
    /// 类别
    pub category: ErrorCategory,
    /// 消息
    pub message: String,
    /// 原因链（由外到内）
    pub cause: Option<String>,
    /// 发生时间
    pub timestamp: DateTime<Utc>,
    /// 附加上下文
    pub context: HashMap<String, String>,
    /// 捕获点调用栈
    pub backtrace: Option<String>,
}

impl ErrorInfo {
    /// 创建故障记录
    pub fn new(
        module: impl Into<String>,
        level: ErrorLevel,
        category: ErrorCategory,
        message: impl Into<String>,
        cause: Option<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            module: module.into(),
            level,
            category,
            message: message.into(),
            cause,
            timestamp: Utc::now(),
            context: HashMap::new(),
            backtrace: None,
        }
    }

    /// 由模块故障构造
    pub fn from_fault(fault: &ModuleFault) -> Self {
        let mut info = Self::new(
            fault.module.clone(),
            fault.level,
            fault.category,
            fault.message.clone(),
            fault.cause.clone(),
        );
        info.context.insert("code".to_string(), fault.code.to_string());
        info
    }

    /// 添加上下文
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// 捕获当前调用栈
    pub fn capture_backtrace(&mut self) {
        let bt = std::backtrace::Backtrace::force_capture();
        self.backtrace = Some(bt.to_string());
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}][{}][{}] {}: {}",
            self.timestamp.to_rfc3339(),
            self.level,
            self.category,
            self.module,
            self.message
        )
    }
}

// ==================== 类型化故障 ====================

/// 类型化的模块故障
///
/// 加载、初始化、执行过程中的失败都会转换成 `ModuleFault` 交给调用方。
/// 可克隆，因此共享同一次加载的多个调用方能得到完全一致的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFault {
    /// 模块名
    pub module: String,
    /// 类别
    pub category: ErrorCategory,
    /// 级别
    pub level: ErrorLevel,
    /// 消息
    pub message: String,
    /// 原因链
    pub cause: Option<String>,
    /// 错误码
    pub code: &'static str,
}

impl ModuleFault {
    /// 创建故障
    pub fn new(
        module: impl Into<String>,
        category: ErrorCategory,
        level: ErrorLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            category,
            level,
            message: message.into(),
            cause: None,
            code: crate::utils::error::error_code::INTERNAL,
        }
    }

    /// 从运行时错误分类得到故障
    ///
    /// 已经是故障的错误原样返回。
    pub fn from_error(module: &str, err: &CjmodError) -> Self {
        if let Some(fault) = err.as_fault() {
            return fault.clone();
        }
        let mut cause = None;
        let mut source = std::error::Error::source(err);
        while let Some(inner) = source {
            cause = Some(match cause {
                Some(prev) => format!("{}: {}", prev, inner),
                None => inner.to_string(),
            });
            source = inner.source();
        }
        Self {
            module: module.to_string(),
            category: err.category(),
            level: err.default_level(),
            message: err.to_string(),
            cause,
            code: err.error_code(),
        }
    }

    /// 覆盖类别
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// 覆盖级别
    pub fn with_level(mut self, level: ErrorLevel) -> Self {
        self.level = level;
        self
    }

    /// 设置原因
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// 是否为执行时间超限
    pub fn is_time_limit(&self) -> bool {
        self.code == crate::utils::error::error_code::SANDBOX_TIME_LIMIT
    }
}

impl fmt::Display for ModuleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}][{}] 模块 '{}' 故障: {}",
            self.level, self.category, self.module, self.message
        )?;
        if let Some(cause) = &self.cause {
            write!(f, " (原因: {})", cause)?;
        }
        Ok(())
    }
}

// ==================== 统计 ====================

/// 单个模块的故障统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorStatistics {
    /// 模块名
    pub module: String,
    /// 按级别计数
    pub by_level: HashMap<ErrorLevel, u64>,
    /// 按类别计数
    pub by_category: HashMap<ErrorCategory, u64>,
    /// 总数
    pub total: u64,
    /// 成功恢复数
    pub recovered: u64,
    /// 最近一次故障时间
    pub last_error_at: Option<DateTime<Utc>>,
}

impl ErrorStatistics {
    /// 创建空统计
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Default::default()
        }
    }

    /// 记录一次故障
    pub fn record_error(&mut self, error: &ErrorInfo) {
        *self.by_level.entry(error.level).or_insert(0) += 1;
        *self.by_category.entry(error.category).or_insert(0) += 1;
        self.total += 1;
        self.last_error_at = Some(error.timestamp);
    }

    /// 记录一次恢复
    pub fn record_recovery(&mut self) {
        self.recovered += 1;
    }

    /// 某级别的故障数
    pub fn count_for_level(&self, level: ErrorLevel) -> u64 {
        self.by_level.get(&level).copied().unwrap_or(0)
    }

    /// 某类别的故障数
    pub fn count_for_category(&self, category: ErrorCategory) -> u64 {
        self.by_category.get(&category).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(ErrorLevel::Debug < ErrorLevel::Info);
        assert!(ErrorLevel::Warning < ErrorLevel::Error);
        assert!(ErrorLevel::Critical < ErrorLevel::Fatal);
        assert_eq!(ErrorLevel::Fatal.severity(), 5);
    }

    #[test]
    fn test_level_serde() {
        let json = serde_json::to_string(&ErrorLevel::Warning).unwrap();
        assert_eq!(json, "\"WARNING\"");
        let level: ErrorLevel = serde_json::from_str("\"FATAL\"").unwrap();
        assert_eq!(level, ErrorLevel::Fatal);
    }

    #[test]
    fn test_fault_from_error() {
        let err = CjmodError::PermissionDenied {
            module: "m".to_string(),
            operation: "网络访问".to_string(),
            reason: "未授权".to_string(),
        };
        let fault = ModuleFault::from_error("m", &err);
        assert_eq!(fault.category, ErrorCategory::Security);
        assert_eq!(fault.level, ErrorLevel::Error);
        assert_eq!(fault.code, "SANDBOX-001");
    }

    #[test]
    fn test_fault_cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = CjmodError::Other(anyhow::Error::new(io).context("写入资源失败"));
        let fault = ModuleFault::from_error("m", &err);
        assert!(fault.cause.as_deref().unwrap_or("").contains("disk full"));
    }

    #[test]
    fn test_statistics() {
        let mut stats = ErrorStatistics::new("m");
        let info = ErrorInfo::new("m", ErrorLevel::Error, ErrorCategory::Execution, "boom", None);
        stats.record_error(&info);
        stats.record_error(&info);
        stats.record_recovery();

        assert_eq!(stats.total, 2);
        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.count_for_level(ErrorLevel::Error), 2);
        assert_eq!(stats.count_for_category(ErrorCategory::Execution), 2);
        assert_eq!(stats.count_for_category(ErrorCategory::Security), 0);
        assert!(stats.last_error_at.is_some());
    }

    #[test]
    fn test_error_info_display() {
        let info = ErrorInfo::new("m", ErrorLevel::Fatal, ErrorCategory::Internal, "崩溃", None)
            .with_context("thread", "main");
        let text = info.to_string();
        assert!(text.contains("[FATAL][INTERNAL] m: 崩溃"));
        assert_eq!(info.context.get("thread").map(String::as_str), Some("main"));
    }
}
