//! 模块管理模块
//!
//! 包含模块运行时的核心组件：
//! - 版本与版本范围
//! - 模块描述符、清单解析与已安装模块仓库
//! - 依赖图与依赖解析
//! - 加载器、运行时契约与生命周期管理
//! - 执行上下文、全局状态与函数结果缓存

pub mod cache;
pub mod context;
pub mod dependency;
pub mod lifecycle;
pub mod loader;
pub mod metadata;
pub mod parser;
pub mod repository;
pub mod runtime;
pub mod state;
pub mod version;

// 重导出常用类型
pub use cache::{CacheKey, CacheStats, FunctionCache};
pub use context::{CompilationContext, DomHandle, ExecutionContext, ModuleInvoker};
pub use dependency::{DependencyGraph, DependencyGraphResolver, DependencyResolution, ModuleIndex};
pub use lifecycle::{ExecutionOptions, LifecycleListener, LifecycleManager, LifecycleServices};
pub use loader::{ArchiveLoader, BuildOutput, DirectoryLoader, LoadedArtifact, LoaderChain, ModuleLoader};
pub use metadata::{
    Dependency, FunctionParams, FunctionResult, FunctionSignature, LoadedModule, ModuleDescriptor,
    ModuleState, Parameter,
};
pub use parser::{ManifestFormat, ManifestParser};
pub use repository::{InstalledModule, ModuleRepository, RepositorySnapshot};
pub use runtime::{CjmodModule, InitContext, LinkUnit, ModuleFactory, ModuleFactoryRegistry};
pub use state::{StateChange, StateEntry, StateQuery, StateStore};
pub use version::{ModuleVersion, VersionRange};
