//! 沙箱配置
//!
//! [`SandboxConfig`] 是不可变的能力与配额描述，通过字段初始化或链式构造函数创建。
//! 附加到 [`SandboxContext`](super::SandboxContext) 后只读。
//!
//! # 内置配置
//!
//! | 配置 | 文件/网络/反射/线程 | 内存 | 时间 | 线程 |
//! |------|------|------|------|------|
//! | default | 全部禁止 | 128MB | 10s | 5 |
//! | restricted | 全部禁止 | 64MB | 5s | 1 |
//! | development | 全部允许 | 512MB | 60s | 20 |

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::CjmodError;

const MB: u64 = 1024 * 1024;

/// 沙箱配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// 允许文件访问
    pub allow_file_access: bool,
    /// 允许网络访问
    pub allow_network_access: bool,
    /// 允许读取系统属性（`cjmod.` 前缀始终可读）
    pub allow_system_properties: bool,
    /// 允许反射（运行时按名称查找并调用符号）
    pub allow_reflection: bool,
    /// 允许创建任务
    pub allow_thread_creation: bool,
    /// 允许访问的符号命名空间
    pub allowed_packages: BTreeSet<String>,
    /// 允许访问的完整符号
    pub allowed_symbols: BTreeSet<String>,
    /// 允许访问的路径前缀
    pub allowed_paths: Vec<PathBuf>,
    /// 允许访问的主机，支持 `*` 和 `*.example.com`
    pub allowed_hosts: BTreeSet<String>,
    /// 内存上限（字节）
    pub max_memory: u64,
    /// 执行时间上限（毫秒）
    pub max_cpu_time_ms: u64,
    /// 并发任务上限
    pub max_threads: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::default_profile()
    }
}

impl SandboxConfig {
    /// 默认配置：禁止所有敏感操作，配额宽松但有上限
    pub fn default_profile() -> Self {
        Self {
            allow_file_access: false,
            allow_network_access: false,
            allow_system_properties: false,
            allow_reflection: false,
            allow_thread_creation: false,
            allowed_packages: ["std", "core", "alloc", "cjmod"]
                .into_iter()
                .map(String::from)
                .collect(),
            allowed_symbols: BTreeSet::new(),
            allowed_paths: Vec::new(),
            allowed_hosts: BTreeSet::new(),
            max_memory: 128 * MB,
            max_cpu_time_ms: 10_000,
            max_threads: 5,
        }
    }

    /// 受限配置：单任务、最小命名空间、短时间预算
    pub fn restricted() -> Self {
        Self {
            allowed_packages: ["core", "std"].into_iter().map(String::from).collect(),
            max_memory: 64 * MB,
            max_cpu_time_ms: 5_000,
            max_threads: 1,
            ..Self::default_profile()
        }
    }

    /// 开发配置：仅用于受信任的本地迭代
    pub fn development() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            allow_file_access: true,
            allow_network_access: true,
            allow_system_properties: true,
            allow_reflection: true,
            allow_thread_creation: true,
            allowed_packages: ["std", "core", "alloc", "cjmod", "chtl"]
                .into_iter()
                .map(String::from)
                .collect(),
            allowed_symbols: BTreeSet::new(),
            allowed_paths: vec![cwd],
            allowed_hosts: ["localhost", "127.0.0.1"].into_iter().map(String::from).collect(),
            max_memory: 512 * MB,
            max_cpu_time_ms: 60_000,
            max_threads: 20,
        }
    }

    // ==================== 链式构造 ====================

    pub fn with_file_access(mut self, allow: bool) -> Self {
        self.allow_file_access = allow;
        self
    }

    pub fn with_network_access(mut self, allow: bool) -> Self {
        self.allow_network_access = allow;
        self
    }

    pub fn with_system_properties(mut self, allow: bool) -> Self {
        self.allow_system_properties = allow;
        self
    }

    pub fn with_reflection(mut self, allow: bool) -> Self {
        self.allow_reflection = allow;
        self
    }

    pub fn with_thread_creation(mut self, allow: bool) -> Self {
        self.allow_thread_creation = allow;
        self
    }

    pub fn allow_package(mut self, package: impl Into<String>) -> Self {
        self.allowed_packages.insert(package.into());
        self
    }

    pub fn allow_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.allowed_symbols.insert(symbol.into());
        self
    }

    pub fn allow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_paths.push(path.into());
        self
    }

    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into());
        self
    }

    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = bytes;
        self
    }

    pub fn with_max_cpu_time(mut self, limit: Duration) -> Self {
        self.max_cpu_time_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_threads(mut self, count: usize) -> Self {
        self.max_threads = count;
        self
    }

    /// 时间上限
    pub fn max_cpu_time(&self) -> Duration {
        Duration::from_millis(self.max_cpu_time_ms)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<(), CjmodError> {
        if self.max_cpu_time_ms == 0 {
            return Err(CjmodError::InvalidConfigValue {
                key: "max_cpu_time_ms".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.max_memory == 0 {
            return Err(CjmodError::InvalidConfigValue {
                key: "max_memory".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.allow_thread_creation && self.max_threads == 0 {
            return Err(CjmodError::InvalidConfigValue {
                key: "max_threads".to_string(),
                reason: "允许创建任务时必须大于 0".to_string(),
            });
        }
        Ok(())
    }
}

// ==================== 配置档 ====================

/// 内置配置档
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxProfile {
    #[default]
    Default,
    Restricted,
    Development,
}

impl SandboxProfile {
    /// 对应的配置
    pub fn config(&self) -> SandboxConfig {
        match self {
            SandboxProfile::Default => SandboxConfig::default_profile(),
            SandboxProfile::Restricted => SandboxConfig::restricted(),
            SandboxProfile::Development => SandboxConfig::development(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxProfile::Default => "default",
            SandboxProfile::Restricted => "restricted",
            SandboxProfile::Development => "development",
        }
    }
}

impl fmt::Display for SandboxProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxProfile {
    type Err = CjmodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(SandboxProfile::Default),
            "restricted" => Ok(SandboxProfile::Restricted),
            "development" | "dev" => Ok(SandboxProfile::Development),
            other => Err(CjmodError::InvalidConfigValue {
                key: "sandbox.profile".to_string(),
                reason: format!("未知的沙箱配置档 '{}'", other),
            }),
        }
    }
}

// ==================== 策略 ====================

/// 沙箱策略：默认配置 + 按模块覆盖
#[derive(Debug, Clone, Default)]
pub struct SandboxPolicy {
    default: SandboxConfig,
    overrides: HashMap<String, SandboxConfig>,
}

impl SandboxPolicy {
    pub fn new(default: SandboxConfig) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn from_profile(profile: SandboxProfile) -> Self {
        Self::new(profile.config())
    }

    pub fn with_override(mut self, module: impl Into<String>, config: SandboxConfig) -> Self {
        self.overrides.insert(module.into(), config);
        self
    }

    /// 模块生效的配置
    pub fn config_for(&self, module: &str) -> &SandboxConfig {
        self.overrides.get(module).unwrap_or(&self.default)
    }

    pub fn default_config(&self) -> &SandboxConfig {
        &self.default
    }
}
