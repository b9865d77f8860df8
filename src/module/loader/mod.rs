//! 模块加载器
//!
//! 加载器按 "能否处理该路径" 多态分派：
//!
//! - [`ArchiveLoader`] - 从 tar.gz 归档加载已编译模块
//! - [`DirectoryLoader`] - 从开发目录加载，源码比构建产物新时先执行外部构建
//!
//! [`LoaderChain`] 按注册顺序选择第一个能处理路径的加载器。
//! 所有加载器产出的 [`LoadedModule`] 都处于 `Loading` 状态，后续状态由生命周期管理器推进。

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::module::metadata::{LoadedModule, ModuleDescriptor};
use crate::module::runtime::CjmodModule;
use crate::utils::{CjmodError, Result};

mod archive;
mod directory;

pub use archive::ArchiveLoader;
pub use directory::{BuildOutput, DirectoryLoader};

/// 加载结果：模块快照与实例
#[derive(Clone)]
pub struct LoadedArtifact {
    pub module: LoadedModule,
    pub instance: Arc<dyn CjmodModule>,
}

impl fmt::Debug for LoadedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedArtifact")
            .field("module", &self.module)
            .finish()
    }
}

/// 模块加载器接口
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// 加载器类型，用于诊断
    fn loader_type(&self) -> &'static str;

    /// 能否处理该路径
    fn can_load(&self, path: &Path) -> bool;

    /// 只读取描述符，不构建也不实例化
    async fn read_descriptor(&self, path: &Path) -> Result<ModuleDescriptor>;

    /// 加载模块
    async fn load(&self, path: &Path) -> Result<LoadedArtifact>;
}

/// 加载器链
#[derive(Clone, Default)]
pub struct LoaderChain {
    loaders: Vec<Arc<dyn ModuleLoader>>,
}

impl LoaderChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn push(&mut self, loader: Arc<dyn ModuleLoader>) {
        self.loaders.push(loader);
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    pub fn can_load(&self, path: &Path) -> bool {
        self.loaders.iter().any(|l| l.can_load(path))
    }

    /// 选择加载器
    ///
    /// # 错误
    ///
    /// 没有加载器能处理时返回 `CjmodError::UnsupportedModule`。
    pub fn find(&self, path: &Path) -> Result<&Arc<dyn ModuleLoader>> {
        self.loaders
            .iter()
            .find(|l| l.can_load(path))
            .ok_or_else(|| CjmodError::UnsupportedModule(path.to_path_buf()))
    }

    pub async fn read_descriptor(&self, path: &Path) -> Result<ModuleDescriptor> {
        self.find(path)?.read_descriptor(path).await
    }

    pub async fn load(&self, path: &Path) -> Result<LoadedArtifact> {
        let loader = self.find(path)?;
        tracing::debug!(path = ?path, loader = loader.loader_type(), "选择加载器");
        loader.load(path).await
    }

    pub fn loader_types(&self) -> Vec<&'static str> {
        self.loaders.iter().map(|l| l.loader_type()).collect()
    }
}

impl fmt::Debug for LoaderChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderChain")
            .field("loaders", &self.loader_types())
            .finish()
    }
}
