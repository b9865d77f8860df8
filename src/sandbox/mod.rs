//! 沙箱
//!
//! 模块初始化和函数执行期间的能力检查与配额限制：
//!
//! - [`SandboxConfig`] / [`SandboxPolicy`] - 不可变的能力与配额配置
//! - [`SandboxEnforcer`] - 创建单次调用的 [`SandboxContext`]，执行超时控制
//! - [`TaskGroup`] - 每个模块的任务组，用于统一中止

pub mod config;
pub mod enforcer;

pub use config::{SandboxConfig, SandboxPolicy, SandboxProfile};
pub use enforcer::{
    FileAccess, SandboxContext, SandboxEnforcer, TaskGroup, ThreadPermit,
    RESERVED_PROPERTY_PREFIX,
};
