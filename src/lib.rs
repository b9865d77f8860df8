//! # CJMOD Runtime - CHTL 扩展模块运行时
//!
//! CJMOD 是 CHTL 编译器的扩展模块机制。本库负责编译器与扩展模块之间的全部运行时工作：
//!
//! - **版本与依赖**: 语义化版本、版本范围匹配、依赖图解析与冲突诊断
//! - **模块加载**: 归档模块（`.cjmod` / `.tar.gz`）与目录模块（按需构建）
//! - **生命周期**: 加载、初始化、激活、挂起、卸载，依赖方级联
//! - **沙箱**: 文件、网络、线程、内存与执行时间的能力检查和配额
//! - **故障处理**: 分级分类的故障记录、统计与恢复策略
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cjmod_runtime::{CjmodRuntime, ModuleFactoryRegistry, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factories = Arc::new(ModuleFactoryRegistry::new());
//!     let runtime = CjmodRuntime::new(RuntimeConfig::default(), factories).await?;
//!
//!     runtime.start().await?;
//!     let module = runtime.load_module("chtl-ui").await?;
//!     println!("{} 已激活", module.descriptor.full_name());
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 版本、描述符、仓库、依赖解析、加载器与生命周期
//! - `sandbox` - 沙箱配置与执行器
//! - `fault` - 故障分类与恢复
//! - `utils` - 错误类型、日志与 ID 生成
//! - `core` - 运行时配置
//! - `api` - `CjmodRuntime` 运行时实例

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod fault;
pub mod module;
pub mod sandbox;
pub mod utils;

// 重导出常用类型，方便使用
pub use module::{
    CjmodModule, Dependency, DependencyGraphResolver, DependencyResolution, ExecutionContext,
    ExecutionOptions, FunctionParams, FunctionResult, FunctionSignature, LifecycleListener,
    LoadedModule, ModuleDescriptor, ModuleFactoryRegistry, ModuleRepository, ModuleState,
    ModuleVersion, Parameter, VersionRange,
};

pub use fault::{ErrorCategory, ErrorInfo, ErrorLevel, FaultHandler, FaultListener, ModuleFault};
pub use sandbox::{SandboxConfig, SandboxEnforcer, SandboxPolicy, SandboxProfile};

pub use utils::{error_code, generate_id, generate_uuid, CjmodError, Result};
pub use utils::logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use crate::core::config::{LogConfig, ModuleConfig, RuntimeConfig, RuntimeConfigBuilder};
pub use api::sdk::{CjmodRuntime, RuntimeInfo, RuntimeState};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
