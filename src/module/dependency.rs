//! 模块依赖管理
//!
//! # 主要组件
//!
//! - [`DependencyGraph`] - 依赖关系图，记录已加载模块间的依赖边，用于环检测、拓扑排序和级联卸载
//! - [`DependencyGraphResolver`] - 依赖解析器，从根模块出发对已安装模块做深度优先解析
//! - [`DependencyResolution`] - 解析结果：模块集合、错误和警告
//!
//! 解析是只读的，不会加载任何模块。缺失的必需依赖记为错误、缺失的可选依赖记为警告，
//! 解析总会走完，以便调用方一次看到全部问题。
//!
//! 同名模块在不同路径上被解析到不同版本时记一条冲突警告，保留较高版本并从它继续解析。
//!
//! # 示例
//!
//! ```rust
//! use cjmod_runtime::module::dependency::DependencyGraph;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_dependency("app", "dom-utils");
//!
//! assert_eq!(graph.dependencies("app"), vec!["dom-utils".to_string()]);
//! assert!(!graph.has_cycle());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::module::repository::InstalledModule;
use crate::module::version::VersionRange;
use crate::utils::{CjmodError, Result};

// ==================== 依赖图 ====================

/// 模块依赖关系图
///
/// 边 `a -> b` 表示 `a` 依赖 `b`。节点按名称有序存储，遍历结果稳定。
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    reverse_edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// 创建空图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加节点，已存在时不做任何事
    pub fn add_module(&mut self, module: &str) {
        self.edges.entry(module.to_string()).or_default();
        self.reverse_edges.entry(module.to_string()).or_default();
    }

    /// 添加依赖边 `module -> dependency`，缺失的节点会自动添加
    pub fn add_dependency(&mut self, module: &str, dependency: &str) {
        self.add_module(module);
        self.add_module(dependency);
        self.edges
            .entry(module.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.reverse_edges
            .entry(dependency.to_string())
            .or_default()
            .insert(module.to_string());
    }

    /// 移除依赖边
    pub fn remove_dependency(&mut self, module: &str, dependency: &str) {
        if let Some(deps) = self.edges.get_mut(module) {
            deps.remove(dependency);
        }
        if let Some(dependents) = self.reverse_edges.get_mut(dependency) {
            dependents.remove(module);
        }
    }

    /// 移除节点及其所有边
    pub fn remove_module(&mut self, module: &str) {
        if let Some(deps) = self.edges.remove(module) {
            for dep in deps {
                if let Some(dependents) = self.reverse_edges.get_mut(&dep) {
                    dependents.remove(module);
                }
            }
        }
        if let Some(dependents) = self.reverse_edges.remove(module) {
            for dependent in dependents {
                if let Some(deps) = self.edges.get_mut(&dependent) {
                    deps.remove(module);
                }
            }
        }
    }

    /// 直接依赖
    pub fn dependencies(&self, module: &str) -> Vec<String> {
        self.edges
            .get(module)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 直接依赖方
    pub fn dependents(&self, module: &str) -> Vec<String> {
        self.reverse_edges
            .get(module)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 全部传递依赖，依赖在前
    pub fn all_dependencies(&self, module: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        Self::post_order(&self.edges, module, &mut visited, &mut result);
        result.retain(|m| m != module);
        result
    }

    /// 全部传递依赖方，按卸载顺序排列（最外层依赖方在前）
    pub fn all_dependents(&self, module: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        Self::post_order(&self.reverse_edges, module, &mut visited, &mut result);
        result.retain(|m| m != module);
        result
    }

    fn post_order(
        adjacency: &BTreeMap<String, BTreeSet<String>>,
        node: &str,
        visited: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }
        if let Some(next) = adjacency.get(node) {
            for n in next {
                Self::post_order(adjacency, n, visited, out);
            }
        }
        out.push(node.to_string());
    }

    /// 是否存在环
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// 查找一个环，返回闭合路径（首尾相同）
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for node in self.edges.keys() {
            if let Some(cycle) = self.find_cycle_from(node, &mut visited, &mut on_stack, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn find_cycle_from(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if on_stack.contains(node) {
            let start = path.iter().position(|n| n == node).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if !visited.insert(node.to_string()) {
            return None;
        }

        on_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(neighbors) = self.edges.get(node) {
            for neighbor in neighbors {
                if let Some(cycle) = self.find_cycle_from(neighbor, visited, on_stack, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_stack.remove(node);
        None
    }

    /// 拓扑排序（Kahn 算法），依赖在依赖方之前
    ///
    /// # 错误
    ///
    /// 存在环时返回 `CjmodError::CircularDependency`。
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(CjmodError::CircularDependency(cycle.join(" -> ")));
        }

        // 入度 = 尚未输出的依赖数
        let mut remaining: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut queue: VecDeque<&str> = remaining
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(node, _)| *node)
            .collect();

        let mut order = Vec::with_capacity(self.edges.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            if let Some(dependents) = self.reverse_edges.get(node) {
                for dependent in dependents {
                    if let Some(degree) = remaining.get_mut(dependent.as_str()) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent.as_str());
                        }
                    }
                }
            }
        }

        if order.len() != self.edges.len() {
            return Err(CjmodError::CircularDependency("无法完成拓扑排序".to_string()));
        }
        Ok(order)
    }

    /// 加载顺序
    pub fn load_order(&self) -> Result<Vec<String>> {
        self.topological_sort()
    }

    /// 卸载顺序（加载顺序的反序）
    pub fn unload_order(&self) -> Result<Vec<String>> {
        let mut order = self.topological_sort()?;
        order.reverse();
        Ok(order)
    }

    /// 清空
    pub fn clear(&mut self) {
        self.edges.clear();
        self.reverse_edges.clear();
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// 节点数量
    pub fn module_count(&self) -> usize {
        self.edges.len()
    }

    /// 是否包含节点
    pub fn contains_module(&self, module: &str) -> bool {
        self.edges.contains_key(module)
    }

    /// 全部节点
    pub fn modules(&self) -> Vec<String> {
        self.edges.keys().cloned().collect()
    }
}

// ==================== 解析 ====================

/// 已安装模块的只读索引
pub trait ModuleIndex {
    /// 查找满足范围的最高版本
    fn find(&self, name: &str, range: &VersionRange) -> Option<InstalledModule>;
}

/// 依赖解析结果
#[derive(Debug, Clone, Default)]
pub struct DependencyResolution {
    root: Option<String>,
    modules: Vec<InstalledModule>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl DependencyResolution {
    /// 根模块名
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// 解析得到的模块（按发现顺序，根模块在前）
    pub fn modules(&self) -> &[InstalledModule] {
        &self.modules
    }

    /// 按名称获取
    pub fn get(&self, name: &str) -> Option<&InstalledModule> {
        self.modules.iter().find(|m| m.descriptor.name == name)
    }

    /// 是否包含模块
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 模块名列表
    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.descriptor.name.clone()).collect()
    }

    /// 错误
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// 警告
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// 是否没有错误
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// 由解析结果构造依赖图，只包含解析集合内的边
    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for module in &self.modules {
            graph.add_module(&module.descriptor.name);
            for dep in &module.descriptor.dependencies {
                if self.contains(&dep.name) {
                    graph.add_dependency(&module.descriptor.name, &dep.name);
                }
            }
        }
        graph
    }

    /// 加载顺序
    pub fn load_order(&self) -> Result<Vec<String>> {
        self.dependency_graph().load_order()
    }

    fn insert(&mut self, module: InstalledModule) {
        match self
            .modules
            .iter_mut()
            .find(|m| m.descriptor.name == module.descriptor.name)
        {
            Some(slot) => *slot = module,
            None => self.modules.push(module),
        }
    }
}

/// 遍历中收集的诊断，归属于发出它的模块版本
enum Finding {
    Error(String),
    Warning(String),
}

#[derive(Default)]
struct Walk {
    visited: HashSet<String>,
    conflicts: HashSet<(String, String, String)>,
    findings: Vec<(String, Finding)>,
}

/// 依赖解析器
pub struct DependencyGraphResolver<'a, I: ModuleIndex + ?Sized> {
    index: &'a I,
}

impl<'a, I: ModuleIndex + ?Sized> DependencyGraphResolver<'a, I> {
    /// 基于索引创建解析器
    pub fn new(index: &'a I) -> Self {
        Self { index }
    }

    /// 解析 `name` 在 `range` 内最高版本的依赖闭包
    ///
    /// 版本冲突保留较高版本后，只被较低版本引入的模块从结果中移除，
    /// 它们产生的错误随之丢弃，并各留下一条警告。
    pub fn resolve(&self, name: &str, range: &VersionRange) -> DependencyResolution {
        let mut resolution = DependencyResolution {
            root: Some(name.to_string()),
            ..Default::default()
        };

        let Some(root) = self.index.find(name, range) else {
            resolution
                .errors
                .push(format!("模块未找到: {}@{}", name, range.expression()));
            return resolution;
        };

        let mut walk = Walk::default();
        self.visit(root, &mut resolution, &mut walk);
        prune_unreachable(name, &mut resolution);

        let kept: HashSet<String> = resolution
            .modules
            .iter()
            .map(|m| m.descriptor.full_name())
            .collect();
        for (owner, finding) in walk.findings {
            if !kept.contains(&owner) {
                continue;
            }
            match finding {
                Finding::Error(message) => resolution.errors.push(message),
                Finding::Warning(message) => resolution.warnings.push(message),
            }
        }

        debug!(
            module = %name,
            resolved = resolution.modules.len(),
            errors = resolution.errors.len(),
            warnings = resolution.warnings.len(),
            "依赖解析完成"
        );
        resolution
    }

    fn visit(&self, module: InstalledModule, resolution: &mut DependencyResolution, walk: &mut Walk) {
        let owner = module.descriptor.full_name();
        if !walk.visited.insert(owner.clone()) {
            return;
        }

        let dependencies = module.descriptor.dependencies.clone();
        resolution.insert(module);

        for dep in dependencies {
            let Some(found) = self.index.find(&dep.name, &dep.range) else {
                let finding = if dep.optional {
                    Finding::Warning(format!("可选依赖未找到: {}@{}", dep.name, dep.range.expression()))
                } else {
                    Finding::Error(format!("必需依赖未找到: {}@{}", dep.name, dep.range.expression()))
                };
                walk.findings.push((owner.clone(), finding));
                continue;
            };

            let existing = resolution.get(&dep.name).map(|m| m.descriptor.version.clone());
            match existing {
                Some(existing) if existing != found.descriptor.version => {
                    let (low, high) = if existing < found.descriptor.version {
                        (existing.clone(), found.descriptor.version.clone())
                    } else {
                        (found.descriptor.version.clone(), existing.clone())
                    };
                    if walk
                        .conflicts
                        .insert((dep.name.clone(), low.to_string(), high.to_string()))
                    {
                        warn!(module = %dep.name, low = %low, high = %high, "依赖版本冲突，保留较高版本");
                        resolution.warnings.push(format!(
                            "依赖 {} 版本冲突: {} 与 {}，保留 {}",
                            dep.name, existing, found.descriptor.version, high
                        ));
                    }
                    if found.descriptor.version > existing {
                        self.visit(found, resolution, walk);
                    }
                }
                _ => self.visit(found, resolution, walk),
            }
        }
    }
}

/// 移除从根模块沿选定版本的依赖边不可达的模块
fn prune_unreachable(root: &str, resolution: &mut DependencyResolution) {
    let mut reachable = HashSet::new();
    let mut stack = vec![root.to_string()];
    while let Some(current) = stack.pop() {
        if !reachable.insert(current.clone()) {
            continue;
        }
        if let Some(module) = resolution.get(&current) {
            stack.extend(
                module
                    .descriptor
                    .dependencies
                    .iter()
                    .filter(|dep| resolution.contains(&dep.name))
                    .map(|dep| dep.name.clone()),
            );
        }
    }

    let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut resolution.modules)
        .into_iter()
        .partition(|m| reachable.contains(&m.descriptor.name));
    resolution.modules = kept;
    for module in dropped {
        debug!(module = %module.descriptor.full_name(), "移除只被替换版本引入的模块");
        resolution.warnings.push(format!(
            "模块 {} 只被已替换的版本依赖，已从解析结果移除",
            module.descriptor.full_name()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::metadata::{Dependency, ModuleDescriptor};
    use crate::module::repository::RepositorySnapshot;
    use crate::module::version::ModuleVersion;

    fn module(name: &str, version: &str, deps: &[(&str, &str, bool)]) -> InstalledModule {
        let mut desc = ModuleDescriptor::new(
            name,
            ModuleVersion::parse(version).unwrap(),
            format!("{}::Entry", name),
        );
        for (dep, range, optional) in deps {
            let d = Dependency::new(*dep, VersionRange::parse(range).unwrap());
            desc = desc.with_dependency(if *optional { d.optional() } else { d });
        }
        InstalledModule::new(desc, format!("/modules/{}/{}", name, version))
    }

    fn any() -> VersionRange {
        VersionRange::any()
    }

    // ==================== DependencyGraph 测试 ====================

    #[test]
    fn test_add_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("a", "b");

        assert!(graph.contains_module("a"));
        assert!(graph.contains_module("b"));
        assert_eq!(graph.dependencies("a"), vec!["b"]);
        assert_eq!(graph.dependents("b"), vec!["a"]);
    }

    #[test]
    fn test_remove_module() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("c", "b");
        graph.add_dependency("b", "d");

        graph.remove_module("b");

        assert!(!graph.contains_module("b"));
        assert!(graph.dependencies("a").is_empty());
        assert!(graph.dependents("d").is_empty());
        assert_eq!(graph.module_count(), 3);
    }

    #[test]
    fn test_all_dependents_in_unload_order() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("app", "ui");
        graph.add_dependency("ui", "core");
        graph.add_dependency("tools", "core");

        let dependents = graph.all_dependents("core");
        assert_eq!(dependents.len(), 3);
        let pos = |m: &str| dependents.iter().position(|x| x == m).unwrap();
        assert!(pos("app") < pos("ui"));

        assert_eq!(graph.all_dependencies("app"), vec!["core", "ui"]);
    }

    #[test]
    fn test_find_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("a", "b");
        graph.add_dependency("b", "c");
        assert!(!graph.has_cycle());

        graph.add_dependency("c", "a");
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        assert!(matches!(
            graph.topological_sort(),
            Err(CjmodError::CircularDependency(_))
        ));
    }

    #[test]
    fn test_topological_sort() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("app", "service");
        graph.add_dependency("service", "database");
        graph.add_dependency("app", "database");

        let order = graph.load_order().unwrap();
        assert_eq!(order, vec!["database", "service", "app"]);
        assert_eq!(graph.unload_order().unwrap(), vec!["app", "service", "database"]);
    }

    // ==================== 解析测试 ====================

    #[test]
    fn test_resolve_chain() {
        let index = RepositorySnapshot::from_modules(vec![
            module("A", "1.0.0", &[("B", "^1.0.0", false)]),
            module("B", "1.0.5", &[("C", "~1.2.0", false)]),
            module("C", "1.2.9", &[("D", ">=1.0.0", false)]),
            module("D", "2.0.0", &[]),
        ]);

        let resolution = DependencyGraphResolver::new(&index).resolve("A", &any());

        assert!(resolution.is_success(), "{:?}", resolution.errors());
        let mut names = resolution.module_names();
        names.sort();
        assert_eq!(names, vec!["A", "B", "C", "D"]);
        assert_eq!(resolution.load_order().unwrap(), vec!["D", "C", "B", "A"]);
    }

    #[test]
    fn test_resolve_picks_highest_matching() {
        let index = RepositorySnapshot::from_modules(vec![
            module("A", "1.0.0", &[("B", "~1.2.0", false)]),
            module("B", "1.2.1", &[]),
            module("B", "1.2.7", &[]),
            module("B", "1.3.0", &[]),
        ]);

        let resolution = DependencyGraphResolver::new(&index).resolve("A", &any());
        assert_eq!(
            resolution.get("B").unwrap().descriptor.version,
            ModuleVersion::new(1, 2, 7)
        );
    }

    #[test]
    fn test_conflict_keeps_higher_version() {
        let index = RepositorySnapshot::from_modules(vec![
            module("R", "1.0.0", &[("A", "*", false), ("B", "*", false)]),
            module("A", "1.0.0", &[("C", "1.2.0", false)]),
            module("B", "1.0.0", &[("C", "1.3.0", false)]),
            module("C", "1.2.0", &[]),
            module("C", "1.3.0", &[]),
        ]);

        let resolution = DependencyGraphResolver::new(&index).resolve("R", &any());

        assert!(resolution.is_success());
        assert_eq!(resolution.warnings().len(), 1);
        assert!(resolution.warnings()[0].contains("C"));
        assert_eq!(
            resolution.get("C").unwrap().descriptor.version,
            ModuleVersion::new(1, 3, 0)
        );
        assert_eq!(resolution.modules().len(), 4);
    }

    #[test]
    fn test_conflict_prunes_modules_of_replaced_version() {
        let index = RepositorySnapshot::from_modules(vec![
            module("R", "1.0.0", &[("A", "*", false), ("B", "*", false)]),
            module("A", "1.0.0", &[("C", "1.2.0", false)]),
            module("B", "1.0.0", &[("C", "1.3.0", false)]),
            module("C", "1.2.0", &[("legacy", "*", false), ("gone", "*", false)]),
            module("C", "1.3.0", &[]),
            module("legacy", "1.0.0", &[]),
        ]);

        let resolution = DependencyGraphResolver::new(&index).resolve("R", &any());

        // C@1.2.0 缺失的依赖不再算作错误
        assert!(resolution.is_success(), "{:?}", resolution.errors());
        assert!(!resolution.contains("legacy"));
        let mut names = resolution.module_names();
        names.sort();
        assert_eq!(names, vec!["A", "B", "C", "R"]);
        assert_eq!(resolution.warnings().len(), 2, "{:?}", resolution.warnings());
        assert!(resolution.warnings().iter().any(|w| w.contains("legacy@1.0.0")));
        assert_eq!(resolution.load_order().unwrap().last().map(String::as_str), Some("R"));
    }

    #[test]
    fn test_missing_dependencies_are_collected() {
        let index = RepositorySnapshot::from_modules(vec![module(
            "A",
            "1.0.0",
            &[
                ("missing-1", "^1.0.0", false),
                ("missing-2", "*", false),
                ("nice-to-have", "*", true),
            ],
        )]);

        let resolution = DependencyGraphResolver::new(&index).resolve("A", &any());

        assert!(!resolution.is_success());
        assert_eq!(resolution.errors().len(), 2);
        assert_eq!(resolution.warnings().len(), 1);
        assert!(resolution.contains("A"));
    }

    #[test]
    fn test_root_not_found() {
        let index = RepositorySnapshot::from_modules(vec![module("A", "1.0.0", &[])]);
        let resolution =
            DependencyGraphResolver::new(&index).resolve("A", &VersionRange::parse("^2.0.0").unwrap());

        assert_eq!(resolution.errors().len(), 1);
        assert!(resolution.modules().is_empty());
    }

    #[test]
    fn test_cycle_terminates_and_is_reported_by_load_order() {
        let index = RepositorySnapshot::from_modules(vec![
            module("A", "1.0.0", &[("B", "*", false)]),
            module("B", "1.0.0", &[("A", "*", false)]),
        ]);

        let resolution = DependencyGraphResolver::new(&index).resolve("A", &any());

        assert!(resolution.is_success());
        assert_eq!(resolution.modules().len(), 2);
        assert!(matches!(
            resolution.load_order(),
            Err(CjmodError::CircularDependency(_))
        ));
    }
}
