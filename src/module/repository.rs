//! 模块仓库
//!
//! 记录所有已安装模块及其全部版本，是依赖解析的数据来源。
//!
//! 仓库根目录采用 `root/name/version/` 布局，索引持久化在 `root/modules.index`，
//! 每行一个模块：
//!
//! ```text
//! name|version|path|timestamp
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::module::dependency::ModuleIndex;
use crate::module::loader::LoaderChain;
use crate::module::metadata::ModuleDescriptor;
use crate::module::version::{ModuleVersion, VersionRange};
use crate::utils::{CjmodError, Result};

/// 索引文件名
pub const INDEX_FILE: &str = "modules.index";

/// 已安装模块
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstalledModule {
    /// 描述符
    pub descriptor: ModuleDescriptor,
    /// 模块所在路径（目录或归档文件）
    pub path: PathBuf,
    /// 安装时间
    pub installed_at: DateTime<Utc>,
}

impl InstalledModule {
    pub fn new(descriptor: ModuleDescriptor, path: impl Into<PathBuf>) -> Self {
        Self {
            descriptor,
            path: path.into(),
            installed_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn version(&self) -> &ModuleVersion {
        &self.descriptor.version
    }

    fn index_line(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.descriptor.name,
            self.descriptor.version,
            self.path.display(),
            self.installed_at.timestamp_millis()
        )
    }
}

type VersionTable = BTreeMap<String, BTreeMap<ModuleVersion, InstalledModule>>;

// ==================== 快照 ====================

/// 仓库的只读快照
///
/// 解析器只读取快照，解析过程中仓库的变更不会影响结果。
#[derive(Debug, Clone, Default)]
pub struct RepositorySnapshot {
    modules: VersionTable,
}

impl RepositorySnapshot {
    /// 由模块列表直接构造
    pub fn from_modules(modules: impl IntoIterator<Item = InstalledModule>) -> Self {
        let mut table = VersionTable::new();
        for module in modules {
            table
                .entry(module.descriptor.name.clone())
                .or_default()
                .insert(module.descriptor.version.clone(), module);
        }
        Self { modules: table }
    }

    /// 某模块的全部版本，从低到高
    pub fn versions(&self, name: &str) -> Vec<ModuleVersion> {
        self.modules
            .get(name)
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.modules.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleIndex for RepositorySnapshot {
    fn find(&self, name: &str, range: &VersionRange) -> Option<InstalledModule> {
        self.modules
            .get(name)?
            .iter()
            .rev()
            .find(|(version, _)| range.contains(version))
            .map(|(_, module)| module.clone())
    }
}

// ==================== 仓库 ====================

/// 模块仓库
#[derive(Debug)]
pub struct ModuleRepository {
    root: PathBuf,
    module_paths: Vec<PathBuf>,
    modules: RwLock<VersionTable>,
}

impl ModuleRepository {
    /// 创建仓库
    ///
    /// # Arguments
    ///
    /// * `root` - 安装目标目录，也是索引文件所在目录
    /// * `module_paths` - 扫描路径
    pub fn new(root: impl Into<PathBuf>, module_paths: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            module_paths,
            modules: RwLock::new(VersionTable::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn module_paths(&self) -> &[PathBuf] {
        &self.module_paths
    }

    /// 注册一个已安装模块，同名同版本会被替换
    pub async fn register(&self, module: InstalledModule) {
        debug!(module = %module.name(), version = %module.version(), path = ?module.path, "注册已安装模块");
        self.modules
            .write()
            .await
            .entry(module.descriptor.name.clone())
            .or_default()
            .insert(module.descriptor.version.clone(), module);
    }

    /// 扫描所有模块路径
    ///
    /// 识别三种位置：路径本身即模块、路径下的直接子项是模块、
    /// 以及 `name/version/` 仓库布局。无法识别或清单无效的条目记录警告后跳过。
    ///
    /// # Returns
    ///
    /// 注册成功的模块全名（`name@version`）
    pub async fn scan(&self, loaders: &LoaderChain) -> Result<Vec<String>> {
        let mut registered = Vec::new();
        let mut roots = self.module_paths.clone();
        if !roots.contains(&self.root) {
            roots.push(self.root.clone());
        }

        for dir in roots {
            if !dir.exists() {
                debug!(path = ?dir, "模块路径不存在，跳过");
                continue;
            }
            if loaders.can_load(&dir) {
                self.scan_candidate(&dir, loaders, &mut registered).await;
                continue;
            }

            for child in read_dir_sorted(&dir).await? {
                if loaders.can_load(&child) {
                    self.scan_candidate(&child, loaders, &mut registered).await;
                } else if child.is_dir() {
                    // name/version/ 布局
                    for version_dir in read_dir_sorted(&child).await? {
                        if loaders.can_load(&version_dir) {
                            self.scan_candidate(&version_dir, loaders, &mut registered)
                                .await;
                        }
                    }
                }
            }
        }

        info!(count = registered.len(), "模块扫描完成");
        Ok(registered)
    }

    async fn scan_candidate(&self, path: &Path, loaders: &LoaderChain, registered: &mut Vec<String>) {
        match loaders.read_descriptor(path).await {
            Ok(descriptor) => {
                let full_name = descriptor.full_name();
                self.register(InstalledModule::new(descriptor, path)).await;
                registered.push(full_name);
            }
            Err(e) => warn!(path = ?path, error = %e, "跳过无效模块"),
        }
    }

    /// 安装模块到 `root/name/version/`
    ///
    /// 目录模块整体复制；归档文件复制到版本目录下。已存在的同版本会被覆盖。
    pub async fn install(&self, source: &Path, loaders: &LoaderChain) -> Result<InstalledModule> {
        let descriptor = loaders.read_descriptor(source).await?;
        let target_dir = self
            .root
            .join(&descriptor.name)
            .join(descriptor.version.to_string());

        if target_dir.exists() {
            tokio::fs::remove_dir_all(&target_dir).await?;
        }
        tokio::fs::create_dir_all(&target_dir).await?;

        let installed_path = if source.is_dir() {
            let from = source.to_path_buf();
            let to = target_dir.clone();
            tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .map_err(|e| CjmodError::Internal(format!("安装任务异常终止: {}", e)))??;
            target_dir
        } else {
            let file_name = source
                .file_name()
                .ok_or_else(|| CjmodError::UnsupportedModule(source.to_path_buf()))?;
            let target = target_dir.join(file_name);
            tokio::fs::copy(source, &target).await?;
            target
        };

        let module = InstalledModule::new(descriptor, installed_path);
        info!(module = %module.name(), version = %module.version(), "模块安装完成");
        self.register(module.clone()).await;
        Ok(module)
    }

    /// 移除已安装版本
    ///
    /// 位于仓库根目录下的文件会一并删除。
    pub async fn remove(&self, name: &str, version: &ModuleVersion) -> Result<InstalledModule> {
        let removed = {
            let mut modules = self.modules.write().await;
            let versions = modules
                .get_mut(name)
                .ok_or_else(|| CjmodError::ModuleNotFound(format!("{}@{}", name, version)))?;
            let removed = versions
                .remove(version)
                .ok_or_else(|| CjmodError::ModuleNotFound(format!("{}@{}", name, version)))?;
            if versions.is_empty() {
                modules.remove(name);
            }
            removed
        };

        let version_dir = self.root.join(name).join(version.to_string());
        if version_dir.is_dir() && removed.path.starts_with(&version_dir) {
            tokio::fs::remove_dir_all(&version_dir).await?;
        }

        info!(module = %name, version = %version, "模块已移除");
        Ok(removed)
    }

    /// 查找满足范围的最高版本
    pub async fn find_module(&self, name: &str, range: &VersionRange) -> Option<InstalledModule> {
        let modules = self.modules.read().await;
        modules
            .get(name)?
            .iter()
            .rev()
            .find(|(version, _)| range.contains(version))
            .map(|(_, m)| m.clone())
    }

    /// 最新版本
    pub async fn latest_version(&self, name: &str) -> Option<ModuleVersion> {
        let modules = self.modules.read().await;
        modules.get(name)?.keys().next_back().cloned()
    }

    /// 全部已安装模块，按名称和版本排序
    pub async fn list(&self) -> Vec<InstalledModule> {
        let modules = self.modules.read().await;
        modules
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }

    /// 只读快照
    pub async fn snapshot(&self) -> RepositorySnapshot {
        RepositorySnapshot {
            modules: self.modules.read().await.clone(),
        }
    }

    /// 写入索引文件
    pub async fn save_index(&self) -> Result<PathBuf> {
        let content: String = self
            .list()
            .await
            .iter()
            .map(|m| m.index_line() + "\n")
            .collect();

        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(INDEX_FILE);
        tokio::fs::write(&path, content).await?;
        debug!(path = ?path, "仓库索引已保存");
        Ok(path)
    }

    /// 读取索引文件
    ///
    /// 描述符从模块路径重新读取；路径已不存在或格式错误的行会被跳过。
    ///
    /// # Returns
    ///
    /// 恢复的模块数量
    pub async fn load_index(&self, loaders: &LoaderChain) -> Result<usize> {
        let path = self.root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let mut restored = 0;
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let parts: Vec<&str> = line.splitn(4, '|').collect();
            let [_, _, module_path, timestamp] = parts.as_slice() else {
                warn!(line = %line, "索引行格式错误");
                continue;
            };

            let module_path = PathBuf::from(module_path);
            if !module_path.exists() {
                warn!(path = ?module_path, "索引中的模块路径已不存在");
                continue;
            }

            match loaders.read_descriptor(&module_path).await {
                Ok(descriptor) => {
                    let installed_at = timestamp
                        .parse::<i64>()
                        .ok()
                        .and_then(DateTime::<Utc>::from_timestamp_millis)
                        .unwrap_or_else(Utc::now);
                    self.register(InstalledModule {
                        descriptor,
                        path: module_path,
                        installed_at,
                    })
                    .await;
                    restored += 1;
                }
                Err(e) => warn!(path = ?module_path, error = %e, "索引中的模块无法读取"),
            }
        }
        Ok(restored)
    }

    /// 清空内存索引
    pub async fn clear(&self) {
        self.modules.write().await.clear();
    }
}

async fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

/// 递归复制目录
pub(crate) fn copy_tree(from: &Path, to: &Path) -> Result<u64> {
    let mut copied = 0;
    for entry in walkdir::WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| CjmodError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| CjmodError::Internal(e.to_string()))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::loader::{DirectoryLoader, LoaderChain};
    use std::sync::Arc;

    fn write_module(dir: &Path, name: &str, version: &str) -> PathBuf {
        let module_dir = dir.join(format!("{}-{}", name, version));
        std::fs::create_dir_all(module_dir.join("src")).unwrap();
        std::fs::write(
            module_dir.join("module.json"),
            format!(
                r#"{{"name":"{}","version":"{}","entryPoint":"{}::Entry"}}"#,
                name, version, name
            ),
        )
        .unwrap();
        module_dir
    }

    fn loaders() -> LoaderChain {
        LoaderChain::new().with_loader(Arc::new(DirectoryLoader::default()))
    }

    fn installed(name: &str, version: &str) -> InstalledModule {
        InstalledModule::new(
            ModuleDescriptor::new(name, ModuleVersion::parse(version).unwrap(), "x::Entry"),
            format!("/tmp/{}", name),
        )
    }

    #[tokio::test]
    async fn test_find_highest_satisfying() {
        let repo = ModuleRepository::new("/nonexistent", vec![]);
        for v in ["1.0.0", "1.4.2", "2.0.0-beta.1", "2.0.0"] {
            repo.register(installed("ui", v)).await;
        }

        let found = repo
            .find_module("ui", &VersionRange::parse("^1.0.0").unwrap())
            .await
            .unwrap();
        assert_eq!(found.version().to_string(), "1.4.2");
        assert_eq!(repo.latest_version("ui").await.unwrap().to_string(), "2.0.0");
        assert!(repo
            .find_module("ui", &VersionRange::parse(">=3.0.0").unwrap())
            .await
            .is_none());
        assert_eq!(repo.list().await.len(), 4);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() {
        let repo = ModuleRepository::new("/nonexistent", vec![]);
        repo.register(installed("a", "1.0.0")).await;

        let snapshot = repo.snapshot().await;
        repo.register(installed("a", "2.0.0")).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.find("a", &VersionRange::any()).unwrap().version().to_string(),
            "1.0.0"
        );
    }

    #[tokio::test]
    async fn test_scan_layouts() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "alpha", "1.0.0");
        // name/version/ 布局
        let nested = dir.path().join("beta").join("2.1.0");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("module.json"),
            r#"{"name":"beta","version":"2.1.0","entryPoint":"beta::Entry"}"#,
        )
        .unwrap();
        // 无效清单
        let broken = dir.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("module.json"), "{").unwrap();

        let repo = ModuleRepository::new(dir.path().join("repo"), vec![dir.path().to_path_buf()]);
        let mut registered = repo.scan(&loaders()).await.unwrap();
        registered.sort();

        assert_eq!(registered, vec!["alpha@1.0.0", "beta@2.1.0"]);
    }

    #[tokio::test]
    async fn test_install_remove_and_index() {
        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let module_dir = write_module(src.path(), "gamma", "0.2.0");
        std::fs::write(module_dir.join("src").join("lib.cj"), "fn main() {}").unwrap();

        let repo = ModuleRepository::new(root.path(), vec![]);
        let chain = loaders();
        let module = repo.install(&module_dir, &chain).await.unwrap();

        let expected = root.path().join("gamma").join("0.2.0");
        assert_eq!(module.path, expected);
        assert!(expected.join("src").join("lib.cj").is_file());

        let index_path = repo.save_index().await.unwrap();
        let index = std::fs::read_to_string(&index_path).unwrap();
        assert!(index.starts_with("gamma|0.2.0|"));

        let restored = ModuleRepository::new(root.path(), vec![]);
        assert_eq!(restored.load_index(&chain).await.unwrap(), 1);
        let found = restored.find_module("gamma", &VersionRange::any()).await.unwrap();
        assert_eq!(found.installed_at.timestamp_millis(), module.installed_at.timestamp_millis());

        repo.remove("gamma", &ModuleVersion::new(0, 2, 0)).await.unwrap();
        assert!(!expected.exists());
        assert!(matches!(
            repo.remove("gamma", &ModuleVersion::new(0, 2, 0)).await,
            Err(CjmodError::ModuleNotFound(_))
        ));
    }
}
