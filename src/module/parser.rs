//! 模块清单解析器
//!
//! 负责从 module.json（或 module.yaml）解析 [`ModuleDescriptor`]。
//!
//! 清单字段：
//!
//! - `name`：必填
//! - `version`：缺省为 `1.0.0`
//! - `entryPoint`（兼容 `mainClass`）：必填
//! - `description` / `author` / `license`
//! - `dependencies`：逗号分隔的 `name@range[?optional]` 字符串，或同样格式的字符串数组
//! - `metadata`：任意键值

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::module::metadata::{Dependency, ModuleDescriptor};
use crate::module::version::{ModuleVersion, VersionRange};
use crate::utils::{CjmodError, Result};

/// 默认清单文件名
pub const MANIFEST_FILE: &str = "module.json";

/// 可识别的清单文件名，按优先级排列
pub const MANIFEST_FILES: [&str; 3] = ["module.json", "module.yaml", "module.yml"];

/// 清单格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    /// JSON
    Json,
    /// YAML
    Yaml,
}

impl ManifestFormat {
    /// 根据文件扩展名判断格式，无法识别时按 JSON 处理
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ManifestFormat::Yaml,
            _ => ManifestFormat::Json,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum RawDependencies {
    #[default]
    Absent,
    Tokens(String),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    #[serde(alias = "mainClass", alias = "entry_point")]
    entry_point: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    dependencies: RawDependencies,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

/// 清单解析器
#[derive(Debug, Clone, Default)]
pub struct ManifestParser;

impl ManifestParser {
    /// 在模块目录中查找清单文件
    pub fn find_manifest(dir: &Path) -> Option<PathBuf> {
        MANIFEST_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    /// 从文件解析描述符
    ///
    /// # 错误
    ///
    /// - 文件不存在或无法读取时返回 IO 错误
    /// - 内容不符合格式或验证失败时返回 `InvalidManifest`
    pub async fn parse_file(path: &Path) -> Result<ModuleDescriptor> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse_str(&content, ManifestFormat::from_path(path))
    }

    /// 从文件同步解析描述符
    pub fn parse_file_sync(path: &Path) -> Result<ModuleDescriptor> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_str(&content, ManifestFormat::from_path(path))
    }

    /// 从字符串解析描述符
    pub fn parse_str(content: &str, format: ManifestFormat) -> Result<ModuleDescriptor> {
        let raw: RawManifest = match format {
            ManifestFormat::Json => serde_json::from_str(content)
                .map_err(|e| CjmodError::InvalidManifest(format!("JSON 格式错误: {}", e)))?,
            ManifestFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| CjmodError::InvalidManifest(format!("YAML 格式错误: {}", e)))?,
        };
        Self::build(raw)
    }

    fn build(raw: RawManifest) -> Result<ModuleDescriptor> {
        let mut errors: Vec<String> = Vec::new();

        // 1. 必填字段
        let name = raw.name.unwrap_or_default().trim().to_string();
        if name.is_empty() {
            errors.push("缺少模块名 'name'".to_string());
        }
        let entry_point = raw.entry_point.unwrap_or_default().trim().to_string();
        if entry_point.is_empty() {
            errors.push("缺少入口点 'entryPoint'".to_string());
        }

        // 2. 版本号
        let version = match raw.version.as_deref().map(str::trim) {
            None | Some("") => ModuleVersion::new(1, 0, 0),
            Some(v) => match ModuleVersion::parse(v) {
                Ok(version) => version,
                Err(_) => {
                    errors.push(format!("无效的版本号 '{}'", v));
                    ModuleVersion::new(1, 0, 0)
                }
            },
        };

        // 3. 依赖
        let tokens: Vec<String> = match raw.dependencies {
            RawDependencies::Absent => Vec::new(),
            RawDependencies::Tokens(s) => s.split(',').map(str::to_string).collect(),
            RawDependencies::List(list) => list,
        };
        let mut dependencies = Vec::new();
        for token in tokens.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            match Self::parse_dependency(token) {
                Ok(dep) => dependencies.push(dep),
                Err(CjmodError::InvalidManifest(reason)) => errors.push(reason),
                Err(e) => errors.push(e.to_string()),
            }
        }

        // 4. 元数据统一转为字符串
        let metadata = raw
            .metadata
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect();

        if !errors.is_empty() {
            return Err(CjmodError::InvalidManifest(errors.join("; ")));
        }

        let descriptor = ModuleDescriptor {
            name,
            version,
            entry_point,
            description: raw.description.unwrap_or_default(),
            author: raw.author.unwrap_or_default(),
            license: raw.license.unwrap_or_default(),
            dependencies,
            metadata,
        };

        descriptor
            .validate()
            .map_err(|errors| CjmodError::InvalidManifest(errors.join("; ")))?;
        Ok(descriptor)
    }

    /// 解析单个依赖声明 `name@range[?optional]`
    ///
    /// # 示例
    ///
    /// ```
    /// use cjmod_runtime::module::parser::ManifestParser;
    ///
    /// let dep = ManifestParser::parse_dependency("dom-utils@^2.0.0?optional").unwrap();
    /// assert_eq!(dep.name, "dom-utils");
    /// assert!(dep.optional);
    /// ```
    pub fn parse_dependency(token: &str) -> Result<Dependency> {
        let invalid = |reason: &str| {
            CjmodError::InvalidManifest(format!("无效的依赖声明 '{}': {}", token, reason))
        };

        let (body, optional) = match token.split_once('?') {
            Some((body, "optional")) => (body, true),
            Some((_, flag)) => return Err(invalid(&format!("未知标记 '{}'", flag))),
            None => (token, false),
        };

        let (name, range) = body
            .split_once('@')
            .ok_or_else(|| invalid("缺少 '@' 分隔的版本范围"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("模块名为空"));
        }
        let range = VersionRange::parse(range).map_err(|e| invalid(&e.to_string()))?;

        let dep = Dependency::new(name, range);
        Ok(if optional { dep.optional() } else { dep })
    }
}
