//! 运行时配置
//!
//! 定义运行时的配置结构和加载逻辑。配置文件可以是 JSON 或 YAML，按扩展名选择。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::fault::ErrorLevel;
use crate::sandbox::{SandboxConfig, SandboxPolicy, SandboxProfile};
use crate::utils::{CjmodError, Result};

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 保留日志文件数
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            max_files: default_max_files(),
        }
    }
}

/// 模块配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// 模块搜索路径
    #[serde(default = "default_module_paths")]
    pub module_paths: Vec<PathBuf>,

    /// 安装目标目录
    #[serde(default = "default_repository_root")]
    pub repository_root: PathBuf,

    /// 归档扩展名（不含前导点）
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: Vec<String>,

    /// 源码扩展名，构建时不复制到构建目录
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,

    /// 目录模块的构建命令，支持 `{module}`、`{src}`、`{build}` 占位符
    #[serde(default)]
    pub build_command: Vec<String>,

    /// 启动时自动加载的模块
    #[serde(default)]
    pub auto_load: Vec<String>,

    /// 模块名 -> 初始化配置
    #[serde(default)]
    pub settings: HashMap<String, HashMap<String, Value>>,
}

fn default_module_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("modules")];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".cjmod").join("modules"));
    }
    paths
}

fn default_repository_root() -> PathBuf {
    PathBuf::from("modules")
}

fn default_archive_extensions() -> Vec<String> {
    vec!["cjmod".to_string(), "tar.gz".to_string(), "tgz".to_string()]
}

fn default_source_extensions() -> Vec<String> {
    vec!["cj".to_string(), "rs".to_string()]
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            module_paths: default_module_paths(),
            repository_root: default_repository_root(),
            archive_extensions: default_archive_extensions(),
            source_extensions: default_source_extensions(),
            build_command: Vec::new(),
            auto_load: Vec::new(),
            settings: HashMap::new(),
        }
    }
}

/// 沙箱配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// 默认配置档
    #[serde(default)]
    pub profile: SandboxProfile,

    /// 按模块覆盖的配置
    #[serde(default)]
    pub overrides: HashMap<String, SandboxConfig>,

    /// 连续超时次数阈值，达到后模块进入 ERROR
    #[serde(default = "default_timeout_error_threshold")]
    pub timeout_error_threshold: u32,

    /// 模块可见的系统属性
    #[serde(default)]
    pub system_properties: HashMap<String, String>,
}

fn default_timeout_error_threshold() -> u32 {
    3
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            profile: SandboxProfile::Default,
            overrides: HashMap::new(),
            timeout_error_threshold: default_timeout_error_threshold(),
            system_properties: HashMap::new(),
        }
    }
}

/// 故障处理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultConfig {
    /// 进入错误日志的最低级别
    #[serde(default = "default_min_log_level")]
    pub min_log_level: ErrorLevel,

    /// 错误日志容量，满后丢弃最旧条目
    #[serde(default = "default_max_error_log_size")]
    pub max_error_log_size: usize,

    /// 是否记录调用栈
    #[serde(default = "default_true")]
    pub enable_stack_trace: bool,

    /// 故障报告目录，为空时不写报告
    #[serde(default)]
    pub report_dir: Option<PathBuf>,

    /// 重新加载策略的最大连续尝试次数
    #[serde(default = "default_reload_max_attempts")]
    pub reload_max_attempts: u32,
}

fn default_min_log_level() -> ErrorLevel {
    ErrorLevel::Info
}

fn default_max_error_log_size() -> usize {
    10000
}

fn default_true() -> bool {
    true
}

fn default_reload_max_attempts() -> u32 {
    3
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            min_log_level: default_min_log_level(),
            max_error_log_size: default_max_error_log_size(),
            enable_stack_trace: true,
            report_dir: None,
            reload_max_attempts: default_reload_max_attempts(),
        }
    }
}

/// 全局状态配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// 持久化文件，启动时读取、关闭时写入
    #[serde(default)]
    pub persistence_file: Option<PathBuf>,
}

/// 函数结果缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// 条目有效期（秒）
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_cache_ttl_secs() -> u64 {
    60
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 模块配置
    #[serde(default)]
    pub modules: ModuleConfig,

    /// 沙箱配置
    #[serde(default)]
    pub sandbox: SandboxSettings,

    /// 故障处理配置
    #[serde(default)]
    pub faults: FaultConfig,

    /// 全局状态配置
    #[serde(default)]
    pub state: StateConfig,

    /// 函数结果缓存配置
    #[serde(default)]
    pub cache: CacheConfig,

    /// 是否为开发模式，开发模式下默认沙箱配置档为 development
    #[serde(default)]
    pub dev_mode: bool,
}

impl RuntimeConfig {
    /// 创建配置构建器
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// 从文件加载配置
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CjmodError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;

        let mut config: RuntimeConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        config.validate()?;
        Ok(config)
    }

    /// 合并另一个配置（用于覆盖）
    pub fn merge(&mut self, other: RuntimeConfig) {
        // 只覆盖非默认值的配置
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        for path in other.modules.module_paths {
            if !self.modules.module_paths.contains(&path) {
                self.modules.module_paths.push(path);
            }
        }
        if other.modules.repository_root != default_repository_root() {
            self.modules.repository_root = other.modules.repository_root;
        }
        if !other.modules.build_command.is_empty() {
            self.modules.build_command = other.modules.build_command;
        }
        self.modules.auto_load.extend(other.modules.auto_load);
        self.modules.settings.extend(other.modules.settings);
        if other.sandbox.profile != SandboxProfile::Default {
            self.sandbox.profile = other.sandbox.profile;
        }
        self.sandbox.overrides.extend(other.sandbox.overrides);
        self.sandbox.system_properties.extend(other.sandbox.system_properties);
        if other.sandbox.timeout_error_threshold != default_timeout_error_threshold() {
            self.sandbox.timeout_error_threshold = other.sandbox.timeout_error_threshold;
        }
        if other.faults.report_dir.is_some() {
            self.faults.report_dir = other.faults.report_dir;
        }
        if other.state.persistence_file.is_some() {
            self.state.persistence_file = other.state.persistence_file;
        }
        if !other.cache.enabled {
            self.cache.enabled = false;
        }
        if other.dev_mode {
            self.dev_mode = true;
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if !matches!(
            self.logging.rotation.as_str(),
            "never" | "minutely" | "hourly" | "daily"
        ) {
            return Err(CjmodError::InvalidConfigValue {
                key: "logging.rotation".to_string(),
                reason: format!("未知的轮转策略 '{}'", self.logging.rotation),
            });
        }
        if self.logging.file_output && self.logging.log_dir.is_none() {
            return Err(CjmodError::InvalidConfigValue {
                key: "logging.log_dir".to_string(),
                reason: "启用文件日志时必须指定目录".to_string(),
            });
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(CjmodError::InvalidConfigValue {
                key: "cache.capacity".to_string(),
                reason: "缓存容量必须大于 0".to_string(),
            });
        }
        if self.sandbox.timeout_error_threshold == 0 {
            return Err(CjmodError::InvalidConfigValue {
                key: "sandbox.timeout_error_threshold".to_string(),
                reason: "阈值必须大于 0".to_string(),
            });
        }
        for config in self.sandbox.overrides.values() {
            config.validate()?;
        }
        Ok(())
    }

    /// 生效的默认沙箱配置档
    pub fn effective_profile(&self) -> SandboxProfile {
        if self.dev_mode {
            SandboxProfile::Development
        } else {
            self.sandbox.profile
        }
    }

    /// 由配置构造沙箱策略
    pub fn sandbox_policy(&self) -> SandboxPolicy {
        self.sandbox
            .overrides
            .iter()
            .fold(
                SandboxPolicy::from_profile(self.effective_profile()),
                |policy, (module, config)| policy.with_override(module.clone(), config.clone()),
            )
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    /// 设置配置文件路径
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.config_path = Some(path.into());
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 替换模块搜索路径
    pub fn module_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.config.modules.module_paths = paths;
        self
    }

    /// 添加模块搜索路径
    pub fn module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.modules.module_paths.push(path.into());
        self
    }

    /// 设置安装目录
    pub fn repository_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.modules.repository_root = root.into();
        self
    }

    /// 设置目录模块构建命令
    pub fn build_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.modules.build_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// 添加自动加载的模块
    pub fn auto_load(mut self, module: impl Into<String>) -> Self {
        self.config.modules.auto_load.push(module.into());
        self
    }

    /// 设置模块初始化配置
    pub fn module_setting(mut self, module: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        self.config
            .modules
            .settings
            .entry(module.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    /// 设置默认沙箱配置档
    pub fn sandbox_profile(mut self, profile: SandboxProfile) -> Self {
        self.config.sandbox.profile = profile;
        self
    }

    /// 为模块单独设置沙箱配置
    pub fn sandbox_override(mut self, module: impl Into<String>, config: SandboxConfig) -> Self {
        self.config.sandbox.overrides.insert(module.into(), config);
        self
    }

    /// 设置连续超时阈值
    pub fn timeout_error_threshold(mut self, threshold: u32) -> Self {
        self.config.sandbox.timeout_error_threshold = threshold;
        self
    }

    /// 设置模块可见的系统属性
    pub fn system_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .sandbox
            .system_properties
            .insert(key.into(), value.into());
        self
    }

    /// 设置故障报告目录
    pub fn fault_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.faults.report_dir = Some(dir.into());
        self
    }

    /// 设置故障处理配置
    pub fn faults(mut self, faults: FaultConfig) -> Self {
        self.config.faults = faults;
        self
    }

    /// 设置状态持久化文件
    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.state.persistence_file = Some(path.into());
        self
    }

    /// 设置函数缓存
    pub fn cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.config.cache = CacheConfig {
            enabled: true,
            capacity,
            ttl_secs: ttl.as_secs(),
        };
        self
    }

    /// 禁用函数缓存
    pub fn disable_cache(mut self) -> Self {
        self.config.cache.enabled = false;
        self
    }

    /// 启用开发模式
    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(!config.dev_mode);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.modules.module_paths[0], PathBuf::from("modules"));
        assert_eq!(config.modules.archive_extensions, vec!["cjmod", "tar.gz", "tgz"]);
        assert_eq!(config.sandbox.timeout_error_threshold, 3);
        assert_eq!(config.faults.max_error_log_size, 10000);
        assert_eq!(config.faults.min_log_level, ErrorLevel::Info);
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = RuntimeConfig::builder()
            .log_level("debug")
            .module_paths(vec![PathBuf::from("/opt/cjmod")])
            .build_command(["make", "{module}"])
            .module_setting("chtl-ui", "theme", serde_json::json!("dark"))
            .sandbox_profile(SandboxProfile::Restricted)
            .dev_mode()
            .build();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.modules.module_paths, vec![PathBuf::from("/opt/cjmod")]);
        assert_eq!(config.modules.build_command, vec!["make", "{module}"]);
        assert_eq!(config.modules.settings["chtl-ui"]["theme"], "dark");
        assert_eq!(config.effective_profile(), SandboxProfile::Development);
    }

    #[test]
    fn test_config_merge() {
        let mut base = RuntimeConfig::builder()
            .module_paths(vec![PathBuf::from("a")])
            .build();
        let override_config = RuntimeConfig::builder()
            .log_level("debug")
            .module_paths(vec![PathBuf::from("a"), PathBuf::from("b")])
            .auto_load("chtl-ui")
            .disable_cache()
            .build();

        base.merge(override_config);

        assert_eq!(base.logging.level, "debug");
        assert_eq!(base.modules.module_paths, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(base.modules.auto_load, vec!["chtl-ui"]);
        assert!(!base.cache.enabled);
    }

    #[test]
    fn test_validation() {
        let mut config = RuntimeConfig::default();
        config.logging.rotation = "weekly".to_string();
        assert!(matches!(
            config.validate(),
            Err(CjmodError::InvalidConfigValue { key, .. }) if key == "logging.rotation"
        ));

        let config = RuntimeConfig::builder().cache(0, Duration::from_secs(1)).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sandbox_policy_overrides() {
        let config = RuntimeConfig::builder()
            .sandbox_override("trusted", SandboxConfig::development())
            .build();
        let policy = config.sandbox_policy();
        assert!(policy.config_for("trusted").allow_file_access);
        assert!(!policy.config_for("other").allow_file_access);
    }

    #[tokio::test]
    async fn test_from_file_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("cjmod.yaml");
        std::fs::write(
            &yaml,
            "logging:\n  level: warn\nsandbox:\n  profile: restricted\n  timeout_error_threshold: 5\nfaults:\n  min_log_level: WARNING\n",
        )
        .unwrap();
        let config = RuntimeConfig::from_file(&yaml).await.unwrap();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.sandbox.profile, SandboxProfile::Restricted);
        assert_eq!(config.sandbox.timeout_error_threshold, 5);
        assert_eq!(config.faults.min_log_level, ErrorLevel::Warning);
        assert_eq!(config.config_path.as_deref(), Some(yaml.as_path()));

        let json = dir.path().join("cjmod.json");
        std::fs::write(&json, r#"{"cache":{"capacity":5},"dev_mode":true}"#).unwrap();
        let config = RuntimeConfig::from_file(&json).await.unwrap();
        assert_eq!(config.cache.capacity, 5);
        assert!(config.cache.enabled);
        assert!(config.dev_mode);

        assert!(matches!(
            RuntimeConfig::from_file(dir.path().join("missing.yaml")).await,
            Err(CjmodError::ConfigLoadFailed(_))
        ));
    }
}
