//! 语义化版本与版本范围
//!
//! 版本格式为 `major.minor.patch[-prerelease][+build]`。
//!
//! 排序规则：依次比较主、次、补丁版本号，再比较预发布标识。
//! 没有预发布标识的正式版本高于同号的任何预发布版本；
//! 预发布标识按 `.` 分段：数字段之间按数值比较，数字段总是低于非数字段，
//! 非数字段之间按字典序比较，前缀相同时段数少者较小。
//! 构建元数据只用于展示，不参与比较与相等判断。
//!
//! 版本范围支持：
//!
//! | 写法 | 含义 |
//! |------|------|
//! | `1.2.3` / `=1.2.3` | 精确匹配 |
//! | `>1.2.3` `>=1.2.3` `<1.2.3` `<=1.2.3` | 比较 |
//! | `^1.2.3` | `>=1.2.3 <2.0.0-0`（主版本为 0 时收紧到次版本，再到补丁版本） |
//! | `~1.2.3` | `>=1.2.3 <1.3.0-0` |
//! | `1.0.0 - 2.0.0` | `>=1.0.0 <=2.0.0` |
//! | `1.2.x` `1.x` `*` | 通配符 |
//!
//! 以空白或逗号分隔的多个子句全部按“与”连接。
//!
//! `^` `~` 与通配符的上界带有最小预发布标识 `-0`，上界版本的预发布版本同样被排除。

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::error::{CjmodError, Result};

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:-(\w+(?:\.\w+)*))?(?:\+([\w.]+))?$")
        .expect("Invalid version regex")
});

static OPERATOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(>=?|<=?|=)(.+)$").expect("Invalid operator regex"));

static SEPARATOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s,]+").expect("Invalid separator regex"));

// ==================== ModuleVersion ====================

/// 模块版本
#[derive(Debug, Clone)]
pub struct ModuleVersion {
    major: u64,
    minor: u64,
    patch: u64,
    pre_release: Option<String>,
    build: Option<String>,
}

impl ModuleVersion {
    /// 创建正式版本
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: None,
            build: None,
        }
    }

    /// 解析版本字符串
    ///
    /// # 示例
    ///
    /// ```
    /// use cjmod_runtime::module::version::ModuleVersion;
    ///
    /// let v = ModuleVersion::parse("1.2.3-beta.2+build.7").unwrap();
    /// assert_eq!(v.major(), 1);
    /// assert_eq!(v.pre_release(), Some("beta.2"));
    /// assert!(ModuleVersion::parse("1.2").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let caps = VERSION_REGEX
            .captures(input.trim())
            .ok_or_else(|| CjmodError::MalformedVersion(input.to_string()))?;

        let number = |i: usize| -> Result<u64> {
            caps[i]
                .parse::<u64>()
                .map_err(|_| CjmodError::MalformedVersion(input.to_string()))
        };

        Ok(Self {
            major: number(1)?,
            minor: number(2)?,
            patch: number(3)?,
            pre_release: caps.get(4).map(|m| m.as_str().to_string()),
            build: caps.get(5).map(|m| m.as_str().to_string()),
        })
    }

    /// 设置预发布标识
    pub fn with_pre_release(mut self, pre_release: impl Into<String>) -> Self {
        self.pre_release = Some(pre_release.into());
        self
    }

    /// 设置构建元数据
    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    /// 主版本号
    pub fn major(&self) -> u64 {
        self.major
    }

    /// 次版本号
    pub fn minor(&self) -> u64 {
        self.minor
    }

    /// 补丁版本号
    pub fn patch(&self) -> u64 {
        self.patch
    }

    /// 预发布标识
    pub fn pre_release(&self) -> Option<&str> {
        self.pre_release.as_deref()
    }

    /// 构建元数据
    pub fn build(&self) -> Option<&str> {
        self.build.as_deref()
    }

    /// 是否为预发布版本
    pub fn is_pre_release(&self) -> bool {
        self.pre_release.is_some()
    }

    /// 下一个主版本
    pub fn next_major(&self) -> Self {
        Self::new(self.major + 1, 0, 0)
    }

    /// 下一个次版本
    pub fn next_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1, 0)
    }

    /// 下一个补丁版本
    pub fn next_patch(&self) -> Self {
        Self::new(self.major, self.minor, self.patch + 1)
    }

    /// 当前版本能否替代 `required`
    ///
    /// 主版本必须相同；主版本为 0 时次版本也必须相同。
    pub fn is_compatible_with(&self, required: &ModuleVersion) -> bool {
        if self.major != required.major {
            return false;
        }
        if self.major == 0 {
            return self.minor == required.minor && self.patch >= required.patch;
        }
        self >= required
    }

    /// 是否满足版本范围
    pub fn satisfies(&self, range: &VersionRange) -> bool {
        range.contains(self)
    }
}

fn compare_pre_release(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.split('.').collect();
    let right: Vec<&str> = b.split('.').collect();

    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(ln), Ok(rn)) => ln.cmp(&rn),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => l.cmp(r),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

impl Ord for ModuleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_pre_release(a, b),
            })
    }
}

impl PartialOrd for ModuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ModuleVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ModuleVersion {}

impl Hash for ModuleVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.major.hash(state);
        self.minor.hash(state);
        self.patch.hash(state);
        // 数值相等的预发布段（如 "01" 与 "1"）必须得到相同的哈希
        if let Some(pre) = &self.pre_release {
            for part in pre.split('.') {
                match part.parse::<u64>() {
                    Ok(n) => n.hash(state),
                    Err(_) => part.hash(state),
                }
            }
        }
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{}", pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for ModuleVersion {
    type Err = CjmodError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ModuleVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ModuleVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ==================== 范围条件 ====================

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionOp {
    /// `=`
    Eq,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl VersionOp {
    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "=" => Some(VersionOp::Eq),
            ">" => Some(VersionOp::Gt),
            ">=" => Some(VersionOp::Ge),
            "<" => Some(VersionOp::Lt),
            "<=" => Some(VersionOp::Le),
            _ => None,
        }
    }

    /// 运算符符号
    pub fn symbol(&self) -> &'static str {
        match self {
            VersionOp::Eq => "=",
            VersionOp::Gt => ">",
            VersionOp::Ge => ">=",
            VersionOp::Lt => "<",
            VersionOp::Le => "<=",
        }
    }
}

/// 原子比较条件
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Condition {
    /// 运算符
    pub op: VersionOp,
    /// 比较对象
    pub version: ModuleVersion,
}

impl Condition {
    /// 创建条件
    pub fn new(op: VersionOp, version: ModuleVersion) -> Self {
        Self { op, version }
    }

    /// 判断版本是否满足条件
    pub fn test(&self, version: &ModuleVersion) -> bool {
        let ordering = version.cmp(&self.version);
        match self.op {
            VersionOp::Eq => ordering == Ordering::Equal,
            VersionOp::Gt => ordering == Ordering::Greater,
            VersionOp::Ge => ordering != Ordering::Less,
            VersionOp::Lt => ordering == Ordering::Less,
            VersionOp::Le => ordering != Ordering::Greater,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.symbol(), self.version)
    }
}

// ==================== VersionRange ====================

/// 版本范围
///
/// 版本满足范围当且仅当满足其中的每一个条件。没有条件的范围匹配任意版本。
#[derive(Debug, Clone)]
pub struct VersionRange {
    expression: String,
    conditions: Vec<Condition>,
}

impl VersionRange {
    /// 解析范围表达式
    ///
    /// # 示例
    ///
    /// ```
    /// use cjmod_runtime::module::version::{ModuleVersion, VersionRange};
    ///
    /// let range = VersionRange::parse("^1.2.3").unwrap();
    /// assert!(range.contains(&ModuleVersion::parse("1.9.9").unwrap()));
    /// assert!(!range.contains(&ModuleVersion::parse("2.0.0").unwrap()));
    /// ```
    pub fn parse(expression: &str) -> Result<Self> {
        let tokens: Vec<&str> = SEPARATOR_REGEX
            .split(expression.trim())
            .filter(|t| !t.is_empty())
            .collect();

        let mut conditions = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let token = tokens[i];

            if i + 2 < tokens.len() && tokens[i + 1] == "-" {
                let from = parse_in_range(expression, token)?;
                let to = parse_in_range(expression, tokens[i + 2])?;
                conditions.push(Condition::new(VersionOp::Ge, from));
                conditions.push(Condition::new(VersionOp::Le, to));
                i += 3;
                continue;
            }

            parse_clause(expression, token, &mut conditions)?;
            i += 1;
        }

        Ok(Self {
            expression: expression.trim().to_string(),
            conditions,
        })
    }

    /// 匹配任意版本
    pub fn any() -> Self {
        Self {
            expression: "*".to_string(),
            conditions: Vec::new(),
        }
    }

    /// 只匹配指定版本
    pub fn exact(version: &ModuleVersion) -> Self {
        Self {
            expression: format!("={}", version),
            conditions: vec![Condition::new(VersionOp::Eq, version.clone())],
        }
    }

    /// 版本是否在范围内
    pub fn contains(&self, version: &ModuleVersion) -> bool {
        self.conditions.iter().all(|c| c.test(version))
    }

    /// 是否匹配任意版本
    pub fn is_any(&self) -> bool {
        self.conditions.is_empty()
    }

    /// 原始表达式
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 展开后的条件列表
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// 在候选版本中找出满足范围的最高版本
    pub fn best_match<'a, I>(&self, candidates: I) -> Option<&'a ModuleVersion>
    where
        I: IntoIterator<Item = &'a ModuleVersion>,
    {
        candidates.into_iter().filter(|v| self.contains(v)).max()
    }
}

fn parse_in_range(expression: &str, token: &str) -> Result<ModuleVersion> {
    ModuleVersion::parse(token).map_err(|_| CjmodError::InvalidRange {
        range: expression.to_string(),
        reason: format!("无效的版本 '{}'", token),
    })
}

/// 排他上界：`upper` 本身及其所有预发布版本都不在范围内
fn exclusive_upper(upper: ModuleVersion) -> Condition {
    Condition::new(VersionOp::Lt, upper.with_pre_release("0"))
}

fn is_wildcard(segment: &str) -> bool {
    matches!(segment, "x" | "X" | "*")
}

fn parse_clause(expression: &str, token: &str, out: &mut Vec<Condition>) -> Result<()> {
    if let Some(rest) = token.strip_prefix('^') {
        let v = parse_in_range(expression, rest)?;
        let upper = if v.major() > 0 {
            v.next_major()
        } else if v.minor() > 0 {
            v.next_minor()
        } else {
            v.next_patch()
        };
        out.push(Condition::new(VersionOp::Ge, v));
        out.push(exclusive_upper(upper));
        return Ok(());
    }

    if let Some(rest) = token.strip_prefix('~') {
        let v = parse_in_range(expression, rest)?;
        let upper = v.next_minor();
        out.push(Condition::new(VersionOp::Ge, v));
        out.push(exclusive_upper(upper));
        return Ok(());
    }

    if let Some(caps) = OPERATOR_REGEX.captures(token) {
        let op = VersionOp::from_symbol(&caps[1]).ok_or_else(|| CjmodError::InvalidRange {
            range: expression.to_string(),
            reason: format!("未知运算符 '{}'", &caps[1]),
        })?;
        let v = parse_in_range(expression, &caps[2])?;
        out.push(Condition::new(op, v));
        return Ok(());
    }

    let segments: Vec<&str> = token.split('.').collect();
    if segments.iter().any(|s| is_wildcard(s)) {
        return parse_wildcard(expression, token, &segments, out);
    }

    out.push(Condition::new(VersionOp::Eq, parse_in_range(expression, token)?));
    Ok(())
}

fn parse_wildcard(
    expression: &str,
    token: &str,
    segments: &[&str],
    out: &mut Vec<Condition>,
) -> Result<()> {
    let invalid = || CjmodError::InvalidRange {
        range: expression.to_string(),
        reason: format!("无效的通配符 '{}'", token),
    };
    let number = |s: &str| s.parse::<u64>().map_err(|_| invalid());

    if segments.len() > 3 {
        return Err(invalid());
    }

    match segments {
        [first, ..] if is_wildcard(*first) => Ok(()),
        [major, second, ..] if is_wildcard(*second) => {
            let v = ModuleVersion::new(number(*major)?, 0, 0);
            let upper = v.next_major();
            out.push(Condition::new(VersionOp::Ge, v));
            out.push(exclusive_upper(upper));
            Ok(())
        }
        [major, minor, third] if is_wildcard(*third) => {
            let v = ModuleVersion::new(number(*major)?, number(*minor)?, 0);
            let upper = v.next_minor();
            out.push(Condition::new(VersionOp::Ge, v));
            out.push(exclusive_upper(upper));
            Ok(())
        }
        _ => Err(invalid()),
    }
}

impl PartialEq for VersionRange {
    fn eq(&self, other: &Self) -> bool {
        self.conditions == other.conditions
    }
}

impl Eq for VersionRange {}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conditions.is_empty() {
            return write!(f, "*");
        }
        let parts: Vec<String> = self.conditions.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(" "))
    }
}

impl FromStr for VersionRange {
    type Err = CjmodError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for VersionRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for VersionRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
