//! 归档加载器
//!
//! 归档是 gzip 压缩的 tar 包：
//!
//! ```text
//! module.json            (或 META-INF/cjmod.json)
//! lib/*                  依赖库，记入类路径
//! ...
//! ```

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde_json::Value;
use tracing::{debug, info};

use super::{LoadedArtifact, ModuleLoader};
use crate::module::metadata::{LoadedModule, ModuleDescriptor};
use crate::module::parser::{ManifestFormat, ManifestParser};
use crate::module::runtime::ModuleFactoryRegistry;
use crate::utils::{CjmodError, Result};

/// 归档内可识别的清单位置，按优先级排列
const MANIFEST_ENTRIES: [&str; 2] = ["module.json", "META-INF/cjmod.json"];

const LIB_DIR: &str = "lib";

/// 默认可识别的归档扩展名
const DEFAULT_EXTENSIONS: [&str; 3] = ["cjmod", "tar.gz", "tgz"];

#[derive(Debug)]
struct ArchiveContents {
    descriptor: ModuleDescriptor,
    classpath: Vec<String>,
    entries: usize,
}

/// 归档加载器
#[derive(Debug)]
pub struct ArchiveLoader {
    factories: Arc<ModuleFactoryRegistry>,
    extensions: Vec<String>,
}

impl ArchiveLoader {
    pub fn new(factories: Arc<ModuleFactoryRegistry>) -> Self {
        Self {
            factories,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// 替换可识别的扩展名（不含前导点）
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    async fn inspect(&self, path: &Path) -> Result<ArchiveContents> {
        let archive = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_archive(&archive))
            .await
            .map_err(|e| CjmodError::Internal(format!("归档读取任务异常终止: {}", e)))?
    }
}

/// 归档条目路径必须是相对路径且不含 `..`
fn validate_entry_path(archive: &Path, entry: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(CjmodError::InvalidManifest(format!(
                    "归档 {:?} 包含非法条目路径 '{}'",
                    archive,
                    entry.display()
                )))
            }
        }
    }
    Ok(clean)
}

fn read_archive(path: &Path) -> Result<ArchiveContents> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut manifests: Vec<(usize, String)> = Vec::new();
    let mut classpath = Vec::new();
    let mut entries = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = validate_entry_path(path, &entry.path()?)?;
        entries += 1;

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let normalized = entry_path.to_string_lossy().replace('\\', "/");
        if let Some(priority) = MANIFEST_ENTRIES.iter().position(|m| *m == normalized) {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            manifests.push((priority, content));
        } else if entry_path.starts_with(LIB_DIR) {
            classpath.push(format!("{}!/{}", path.display(), normalized));
        }
    }

    manifests.sort_by_key(|(priority, _)| *priority);
    let (_, manifest) = manifests
        .into_iter()
        .next()
        .ok_or_else(|| CjmodError::MissingManifest(path.to_path_buf()))?;

    let descriptor = ManifestParser::parse_str(&manifest, ManifestFormat::Json)?;
    classpath.sort();
    Ok(ArchiveContents {
        descriptor,
        classpath,
        entries,
    })
}

#[async_trait]
impl ModuleLoader for ArchiveLoader {
    fn loader_type(&self) -> &'static str {
        "archive"
    }

    fn can_load(&self, path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.extensions
            .iter()
            .any(|ext| file_name.ends_with(&format!(".{}", ext.to_lowercase())))
    }

    async fn read_descriptor(&self, path: &Path) -> Result<ModuleDescriptor> {
        Ok(self.inspect(path).await?.descriptor)
    }

    async fn load(&self, path: &Path) -> Result<LoadedArtifact> {
        let contents = self.inspect(path).await?;
        debug!(path = ?path, entries = contents.entries, "归档读取完成");

        let descriptor = contents.descriptor;
        let instance = self
            .factories
            .instantiate(&descriptor.name, &descriptor.entry_point)?;

        let mut module = LoadedModule::new(descriptor, path, self.loader_type());
        module.metadata.insert(
            "classpath".to_string(),
            Value::from(contents.classpath),
        );
        module
            .metadata
            .insert("archive_entries".to_string(), Value::from(contents.entries));

        info!(module = %module.name(), version = %module.version(), "归档模块已加载");
        Ok(LoadedArtifact { module, instance })
    }
}
