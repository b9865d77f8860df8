//! 日志系统模块
//!
//! 基于 tracing 生态：
//!
//! - 控制台输出（pretty 或 JSON）
//! - 文件输出（非阻塞写入，按时间轮转）
//! - `RUST_LOG` 优先，其次是配置的级别和额外过滤指令
//!
//! # 示例
//!
//! ```rust,no_run
//! use cjmod_runtime::utils::logger::{Logger, LoggerConfig, RotationStrategy};
//!
//! let config = LoggerConfig::builder()
//!     .level("debug")
//!     .file_output("./logs")
//!     .rotation(RotationStrategy::Hourly)
//!     .build();
//! let _guard = Logger::try_init(config);
//!
//! tracing::info!(module = "chtl-ui", version = "1.2.0", "模块已激活");
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::core::config::LogConfig;
use crate::utils::{CjmodError, Result};

// ============================================================================
// 日志轮转策略
// ============================================================================

/// 日志轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转（单个日志文件）
    Never,
    /// 每分钟轮转（主要用于测试）
    Minutely,
    /// 每小时轮转
    Hourly,
    /// 每天轮转
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Minutely => Rotation::MINUTELY,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }

    /// 解析轮转策略，无法识别时按天轮转
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "minutely" | "minute" => RotationStrategy::Minutely,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RotationStrategy::Never => "never",
            RotationStrategy::Minutely => "minutely",
            RotationStrategy::Hourly => "hourly",
            RotationStrategy::Daily => "daily",
        };
        f.write_str(s)
    }
}

// ============================================================================
// 日志配置
// ============================================================================

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别（"trace", "debug", "info", "warn", "error"）
    pub level: String,

    /// 是否使用 JSON 格式输出
    pub json_format: bool,

    /// 是否输出到控制台
    pub console_output: bool,

    /// 文件输出目录（None 表示不输出到文件）
    pub file_output: Option<PathBuf>,

    /// 日志文件名前缀
    pub file_prefix: String,

    /// 日志轮转策略
    pub rotation: RotationStrategy,

    /// 保留的最大日志文件数
    pub max_files: usize,

    pub show_target: bool,

    pub show_thread_ids: bool,

    pub show_file_line: bool,

    /// 额外的过滤指令（EnvFilter 格式，逗号分隔）
    /// 例如："cjmod_runtime::sandbox=debug,cjmod_runtime::module::loader=trace"
    pub filter_directives: Option<String>,

    /// 是否启用 ANSI 颜色（仅控制台）
    pub ansi_colors: bool,

    /// 是否在 span 关闭时输出耗时
    pub span_timing: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: "cjmod-runtime".to_string(),
            rotation: RotationStrategy::Daily,
            max_files: 7,
            show_target: true,
            show_thread_ids: false,
            show_file_line: true,
            filter_directives: None,
            ansi_colors: true,
            span_timing: false,
        }
    }
}

impl LoggerConfig {
    /// 创建配置构建器
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::new()
    }

    /// 从运行时配置的 LogConfig 创建
    pub fn from_log_config(log_config: &LogConfig) -> Self {
        Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            file_output: if log_config.file_output {
                log_config.log_dir.clone()
            } else {
                None
            },
            rotation: RotationStrategy::parse(&log_config.rotation),
            max_files: log_config.max_files,
            ..Default::default()
        }
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: LoggerConfig::default(),
        }
    }

    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    /// 设置文件输出目录
    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    pub fn max_files(mut self, count: usize) -> Self {
        self.config.max_files = count;
        self
    }

    pub fn show_target(mut self, enable: bool) -> Self {
        self.config.show_target = enable;
        self
    }

    pub fn show_thread_ids(mut self, enable: bool) -> Self {
        self.config.show_thread_ids = enable;
        self
    }

    pub fn show_file_line(mut self, enable: bool) -> Self {
        self.config.show_file_line = enable;
        self
    }

    /// 追加过滤指令
    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    pub fn ansi_colors(mut self, enable: bool) -> Self {
        self.config.ansi_colors = enable;
        self
    }

    pub fn span_timing(mut self, enable: bool) -> Self {
        self.config.span_timing = enable;
        self
    }

    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

// ============================================================================
// 日志守卫
// ============================================================================

/// 日志系统守卫
///
/// 持有非阻塞写入器的 WorkerGuard，丢弃时等待挂起的日志写入完成。
/// 必须在进程生命周期内保持存活。
#[must_use = "丢弃守卫会停止后台日志写入"]
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

impl LogGuard {
    fn empty() -> Self {
        Self { _guards: Vec::new() }
    }

    /// 是否持有写入器
    pub fn is_active(&self) -> bool {
        !self._guards.is_empty()
    }
}

// ============================================================================
// 日志系统
// ============================================================================

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// 日志系统
pub struct Logger;

impl Logger {
    /// 初始化日志系统
    ///
    /// # Errors
    ///
    /// 已初始化过或全局订阅者已被其他代码设置时返回 `CjmodError::InitFailed`。
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(CjmodError::InitFailed(
                "日志系统已初始化，不能重复初始化".to_string(),
            ));
        }

        let env_filter = Self::create_env_filter(&config);
        let mut guards = Vec::new();

        let console_layer = if config.console_output {
            let (writer, guard) = tracing_appender::non_blocking(io::stdout());
            guards.push(guard);
            Some(Self::fmt_layer(&config, writer, config.ansi_colors))
        } else {
            None
        };

        let file_layer = match &config.file_output {
            Some(log_dir) => {
                let appender = RollingFileAppender::builder()
                    .rotation(config.rotation.to_rotation())
                    .filename_prefix(&config.file_prefix)
                    .filename_suffix("log")
                    .max_log_files(config.max_files.max(1))
                    .build(log_dir)
                    .map_err(|e| CjmodError::InitFailed(format!("无法创建日志文件: {}", e)))?;
                let (writer, guard) = tracing_appender::non_blocking(appender);
                guards.push(guard);
                Some(Self::fmt_layer(&config, writer, false))
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| CjmodError::InitFailed(format!("日志系统初始化失败: {}", e)))?;

        let _ = LOGGER_INITIALIZED.set(());
        Ok(LogGuard { _guards: guards })
    }

    /// 尝试初始化日志系统，失败时返回空守卫
    ///
    /// 适用于测试或多次调用初始化的场景。
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_else(|_| LogGuard::empty())
    }

    /// 按运行时配置初始化
    pub fn init_from_config(log_config: &LogConfig) -> LogGuard {
        Self::try_init(LoggerConfig::from_log_config(log_config))
    }

    fn create_env_filter(config: &LoggerConfig) -> EnvFilter {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        match &config.filter_directives {
            Some(directives) => directives
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .filter_map(|d| d.parse().ok())
                .fold(filter, EnvFilter::add_directive),
            None => filter,
        }
    }

    fn fmt_layer<S, W>(config: &LoggerConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + 'static,
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let span_events = if config.span_timing {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_span_events(span_events);

        if config.json_format {
            layer.json().with_ansi(false).boxed()
        } else {
            layer.with_ansi(ansi).boxed()
        }
    }
}

// ============================================================================
// 便捷宏
// ============================================================================

/// 创建一次函数执行的 span
///
/// ```rust,ignore
/// let span = cjmod_runtime::execution_span!("chtl-ui", "render", execution_id);
/// let _enter = span.enter();
/// ```
#[macro_export]
macro_rules! execution_span {
    ($module:expr, $function:expr, $execution_id:expr) => {
        tracing::info_span!(
            "execute",
            module = %$module,
            function = %$function,
            execution_id = %$execution_id
        )
    };
}

/// 按故障级别记录一条故障
#[macro_export]
macro_rules! log_fault {
    ($fault:expr) => {{
        let fault = &$fault;
        match fault.level {
            $crate::fault::ErrorLevel::Fatal | $crate::fault::ErrorLevel::Critical => tracing::error!(
                module = %fault.module,
                category = %fault.category,
                level = %fault.level,
                error_code = fault.code,
                "{}",
                fault.message
            ),
            $crate::fault::ErrorLevel::Error | $crate::fault::ErrorLevel::Warning => tracing::warn!(
                module = %fault.module,
                category = %fault.category,
                level = %fault.level,
                error_code = fault.code,
                "{}",
                fault.message
            ),
            _ => tracing::debug!(
                module = %fault.module,
                category = %fault.category,
                level = %fault.level,
                error_code = fault.code,
                "{}",
                fault.message
            ),
        }
    }};
}
