//! 模块元数据定义
//!
//! 定义模块清单 (module.json) 对应的描述符、依赖声明、生命周期状态，
//! 以及模块导出函数的签名与调用结果。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use super::version::{ModuleVersion, VersionRange};

/// 函数调用参数
pub type FunctionParams = HashMap<String, Value>;

// ==================== 描述符 ====================

/// 依赖声明
///
/// 清单中的写法为 `name@range`，可选依赖追加 `?optional`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// 依赖模块名
    pub name: String,

    /// 版本范围
    #[serde(default)]
    pub range: VersionRange,

    /// 是否可选
    #[serde(default)]
    pub optional: bool,
}

impl Dependency {
    /// 创建必需依赖
    pub fn new(name: impl Into<String>, range: VersionRange) -> Self {
        Self {
            name: name.into(),
            range,
            optional: false,
        }
    }

    /// 设置为可选依赖
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// 检查版本是否满足要求
    pub fn version_matches(&self, version: &ModuleVersion) -> bool {
        self.range.contains(version)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.range.expression())?;
        if self.optional {
            write!(f, "?optional")?;
        }
        Ok(())
    }
}

fn default_version() -> ModuleVersion {
    ModuleVersion::new(1, 0, 0)
}

/// 模块描述符
///
/// 由清单解析得到，解析后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    /// 模块名（唯一键）
    pub name: String,

    /// 模块版本，缺省为 1.0.0
    #[serde(default = "default_version")]
    pub version: ModuleVersion,

    /// 入口点标识
    pub entry_point: String,

    /// 模块描述
    #[serde(default)]
    pub description: String,

    /// 作者信息
    #[serde(default)]
    pub author: String,

    /// 许可证
    #[serde(default)]
    pub license: String,

    /// 依赖声明（保持声明顺序）
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// 自定义字段
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ModuleDescriptor {
    /// 创建描述符
    pub fn new(
        name: impl Into<String>,
        version: ModuleVersion,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            entry_point: entry_point.into(),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            dependencies: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// 添加依赖
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// 完整名称 `name@version`
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// 必需依赖
    pub fn required_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| !d.optional)
    }

    /// 验证描述符有效性
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = vec![];

        if self.name.is_empty() {
            errors.push("模块名不能为空".to_string());
        } else if !is_valid_module_name(&self.name) {
            errors.push(format!(
                "无效的模块名: '{}'，只允许字母、数字、'-'、'_'、'.'",
                self.name
            ));
        }

        if self.entry_point.trim().is_empty() {
            errors.push("入口点不能为空".to_string());
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.name.is_empty() {
                errors.push("依赖模块名不能为空".to_string());
            } else if dep.name == self.name {
                errors.push(format!("模块 '{}' 不能依赖自身", self.name));
            } else if !seen.insert(dep.name.as_str()) {
                errors.push(format!("重复的依赖声明: '{}'", dep.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// 模块名是否合法
pub fn is_valid_module_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.')
}

// ==================== 生命周期状态 ====================

/// 模块状态
///
/// ```text
/// Loading → Loaded → Initialized → Active ⇄ Suspended
/// ```
///
/// 任意非终止状态都可以进入 `Error`；`Unloaded` 是唯一的终止状态，任意状态都可进入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModuleState {
    /// 正在加载
    Loading,
    /// 已加载
    Loaded,
    /// 已初始化
    Initialized,
    /// 可执行
    Active,
    /// 已挂起
    Suspended,
    /// 错误状态
    Error,
    /// 已卸载
    Unloaded,
}

impl ModuleState {
    /// 是否允许转换到目标状态
    pub fn can_transition_to(&self, target: ModuleState) -> bool {
        use ModuleState::*;
        match (self, target) {
            (Unloaded, _) => false,
            (_, Unloaded) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Loading, Loaded) => true,
            (Loaded, Initialized) => true,
            (Initialized, Active) => true,
            (Active, Suspended) => true,
            (Suspended, Active) => true,
            _ => false,
        }
    }

    /// 是否可以执行函数
    pub fn is_active(&self) -> bool {
        matches!(self, ModuleState::Active)
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModuleState::Unloaded)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Loading => "LOADING",
            ModuleState::Loaded => "LOADED",
            ModuleState::Initialized => "INITIALIZED",
            ModuleState::Active => "ACTIVE",
            ModuleState::Suspended => "SUSPENDED",
            ModuleState::Error => "ERROR",
            ModuleState::Unloaded => "UNLOADED",
        };
        write!(f, "{}", s)
    }
}

// ==================== 已加载模块 ====================

/// 已加载模块的快照
///
/// 真实状态只由生命周期管理器修改，对外返回的是克隆。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedModule {
    /// 描述符
    pub descriptor: ModuleDescriptor,

    /// 模块来源路径
    pub source_path: PathBuf,

    /// 加载器类型
    pub loader_type: String,

    /// 加载时间
    pub load_time: DateTime<Utc>,

    /// 当前状态
    pub state: ModuleState,

    /// 可变元数据（开发模式标记、最近构建时间、类路径等）
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl LoadedModule {
    /// 创建处于 `Loading` 状态的模块
    pub fn new(
        descriptor: ModuleDescriptor,
        source_path: impl Into<PathBuf>,
        loader_type: impl Into<String>,
    ) -> Self {
        Self {
            descriptor,
            source_path: source_path.into(),
            loader_type: loader_type.into(),
            load_time: Utc::now(),
            state: ModuleState::Loading,
            metadata: HashMap::new(),
        }
    }

    /// 模块名
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// 模块版本
    pub fn version(&self) -> &ModuleVersion {
        &self.descriptor.version
    }

    /// 是否处于开发模式
    pub fn is_development(&self) -> bool {
        self.metadata
            .get("development_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// ==================== 导出函数 ====================

/// 函数参数声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// 参数名
    pub name: String,

    /// 参数类型（仅用于文档）
    #[serde(rename = "type")]
    pub param_type: String,

    /// 是否必需
    pub required: bool,

    /// 缺省值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    /// 描述
    #[serde(default)]
    pub description: String,
}

impl Parameter {
    /// 必需参数
    pub fn required(name: impl Into<String>, param_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            required: true,
            default_value: None,
            description: String::new(),
        }
    }

    /// 可选参数
    pub fn optional(
        name: impl Into<String>,
        param_type: impl Into<String>,
        default_value: Option<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            required: false,
            default_value,
            description: String::new(),
        }
    }

    /// 设置描述
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// 导出函数签名
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSignature {
    /// 函数名
    pub name: String,

    /// 参数列表
    #[serde(default)]
    pub parameters: Vec<Parameter>,

    /// 返回类型（仅用于文档）
    #[serde(default)]
    pub return_type: String,

    /// 描述
    #[serde(default)]
    pub description: String,

    /// 附加属性，例如 `cacheable`
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl FunctionSignature {
    /// 创建签名
    pub fn new(name: impl Into<String>, parameters: Vec<Parameter>) -> Self {
        Self {
            name: name.into(),
            parameters,
            return_type: "any".to_string(),
            description: String::new(),
            attributes: HashMap::new(),
        }
    }

    /// 设置返回类型
    pub fn returns(mut self, return_type: impl Into<String>) -> Self {
        self.return_type = return_type.into();
        self
    }

    /// 设置描述
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 设置属性
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// 标记结果可缓存
    pub fn cacheable(self) -> Self {
        self.with_attribute("cacheable", Value::Bool(true))
    }

    /// 结果是否可缓存
    pub fn is_cacheable(&self) -> bool {
        self.attributes
            .get("cacheable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// 为缺失的可选参数补上缺省值
    pub fn apply_defaults(&self, params: &mut FunctionParams) {
        for param in &self.parameters {
            if let Some(default) = &param.default_value {
                params
                    .entry(param.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }
}

/// 函数调用结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionResult {
    /// 返回值
    pub value: Value,

    /// 生成的目标代码
    #[serde(default)]
    pub generated_code: String,

    /// 附加元数据
    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    /// 警告
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl FunctionResult {
    /// 创建结果
    pub fn new(value: Value) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    /// 创建带生成代码的结果
    pub fn with_code(value: Value, generated_code: impl Into<String>) -> Self {
        Self {
            value,
            generated_code: generated_code.into(),
            ..Default::default()
        }
    }

    /// 添加元数据
    pub fn add_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    /// 添加警告
    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}
