//! 核心模块
//!
//! 包含运行时配置。

pub mod config;

pub use config::{
    CacheConfig, FaultConfig, LogConfig, ModuleConfig, RuntimeConfig, RuntimeConfigBuilder,
    SandboxSettings, StateConfig,
};
