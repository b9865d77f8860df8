//! API 模块
//!
//! 对外提供的 SDK 接口。
//!
//! - `sdk`: `CjmodRuntime` 运行时实例，宿主编译器通过它加载、调用和卸载模块
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cjmod_runtime::{CjmodRuntime, ModuleFactoryRegistry, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::builder().module_path("./modules").build();
//!     let runtime = CjmodRuntime::new(config, Arc::new(ModuleFactoryRegistry::new())).await?;
//!     runtime.start().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod sdk;

// 重导出主要类型
pub use sdk::{CjmodRuntime, RuntimeInfo, RuntimeState};
