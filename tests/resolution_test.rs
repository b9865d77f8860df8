//! # 版本与依赖解析集成测试
//!
//! - 版本解析、比较与范围匹配
//! - 依赖闭包解析、冲突诊断与加载顺序
//! - 仓库索引持久化

use cjmod_runtime::module::{
    DependencyGraphResolver, InstalledModule, ModuleRepository, RepositorySnapshot,
};
use cjmod_runtime::{CjmodError, Dependency, ModuleDescriptor, ModuleVersion, VersionRange};

fn v(s: &str) -> ModuleVersion {
    ModuleVersion::parse(s).unwrap()
}

fn r(s: &str) -> VersionRange {
    VersionRange::parse(s).unwrap()
}

fn installed(name: &str, version: &str, deps: &[(&str, &str)]) -> InstalledModule {
    let mut descriptor = ModuleDescriptor::new(name, v(version), format!("{}.Entry", name));
    for (dep, range) in deps {
        descriptor = descriptor.with_dependency(Dependency::new(*dep, r(range)));
    }
    InstalledModule::new(descriptor, format!("/modules/{}/{}", name, version))
}

// ============================================================================
// 版本
// ============================================================================

#[test]
fn test_version_round_trip() {
    for input in ["0.0.1", "1.2.3", "10.20.30", "1.0.0-alpha.1", "2.0.0-rc.2+build.7"] {
        let parsed = v(input);
        assert_eq!(v(&parsed.to_string()), parsed, "round trip of {}", input);
    }
}

#[test]
fn test_version_total_order() {
    let ordered = ["1.0.0-alpha", "1.0.0-alpha.1", "1.0.0-beta", "1.0.0", "1.0.1", "1.1.0", "2.0.0"];
    for pair in ordered.windows(2) {
        assert!(v(pair[0]) < v(pair[1]), "{} < {}", pair[0], pair[1]);
        assert!(v(pair[1]) > v(pair[0]));
    }
    assert_eq!(v("1.0.0+a").cmp(&v("1.0.0+a")), std::cmp::Ordering::Equal);
}

#[test]
fn test_malformed_versions() {
    for input in ["", "1", "1.2", "a.b.c", "1.2.3.4", "-1.0.0"] {
        assert!(
            matches!(ModuleVersion::parse(input), Err(CjmodError::MalformedVersion(_))),
            "{:?} should be malformed",
            input
        );
    }
}

#[test]
fn test_caret_tilde_and_wildcard_ranges() {
    let caret = r("^1.2.3");
    assert!(caret.contains(&v("1.9.9")));
    assert!(!caret.contains(&v("2.0.0")));
    assert!(!caret.contains(&v("1.2.2")));

    let tilde = r("~1.2.3");
    assert!(tilde.contains(&v("1.2.9")));
    assert!(!tilde.contains(&v("1.3.0")));

    let wildcard = r("1.2.x");
    assert!(wildcard.contains(&v("1.2.0")));
    assert!(wildcard.contains(&v("1.2.999")));
    assert!(!wildcard.contains(&v("1.3.0")));
}

#[test]
fn test_range_clauses_are_and_joined() {
    let range = r(">=1.0.0, <1.5.0");
    assert!(range.contains(&v("1.4.9")));
    assert!(!range.contains(&v("1.5.0")));
    assert!(!range.contains(&v("0.9.0")));

    let hyphen = r("1.0.0 - 2.0.0");
    assert!(hyphen.contains(&v("2.0.0")));
    assert!(!hyphen.contains(&v("2.0.1")));

    assert!(VersionRange::any().contains(&v("99.0.0")));
    assert!(VersionRange::exact(&v("1.2.3")).contains(&v("1.2.3")));
    assert!(!VersionRange::exact(&v("1.2.3")).contains(&v("1.2.4")));
}

#[test]
fn test_best_match_picks_highest() {
    let candidates = [v("1.0.0"), v("1.4.0"), v("1.9.1"), v("2.0.0")];
    assert_eq!(r("^1.0.0").best_match(&candidates), Some(&candidates[2]));
    assert_eq!(r(">=3.0.0").best_match(&candidates), None);
}

// ============================================================================
// 依赖解析
// ============================================================================

#[test]
fn test_resolve_transitive_chain() {
    let snapshot = RepositorySnapshot::from_modules([
        installed("A", "1.0.0", &[("B", "^1.0.0")]),
        installed("B", "1.0.5", &[("C", "~1.2.0")]),
        installed("C", "1.2.9", &[("D", ">=1.0.0")]),
        installed("D", "2.0.0", &[]),
    ]);

    let resolution = DependencyGraphResolver::new(&snapshot).resolve("A", &VersionRange::any());

    assert!(resolution.is_success(), "errors: {:?}", resolution.errors());
    assert!(resolution.errors().is_empty());
    let mut names = resolution.module_names();
    names.sort();
    assert_eq!(names, vec!["A", "B", "C", "D"]);
    assert_eq!(resolution.get("C").unwrap().version(), &v("1.2.9"));
    assert_eq!(resolution.load_order().unwrap(), vec!["D", "C", "B", "A"]);
}

#[test]
fn test_conflict_emits_one_warning_and_keeps_higher() {
    let snapshot = RepositorySnapshot::from_modules([
        installed("app", "1.0.0", &[("left", "^1.0.0"), ("right", "^1.0.0")]),
        installed("left", "1.0.0", &[("C", "=1.2.0")]),
        installed("right", "1.0.0", &[("C", "=1.3.0")]),
        installed("C", "1.2.0", &[]),
        installed("C", "1.3.0", &[]),
    ]);

    let resolution = DependencyGraphResolver::new(&snapshot).resolve("app", &VersionRange::any());

    assert!(resolution.errors().is_empty());
    assert_eq!(resolution.warnings().len(), 1, "warnings: {:?}", resolution.warnings());
    assert!(resolution.warnings()[0].contains('C'));
    assert_eq!(resolution.get("C").unwrap().version(), &v("1.3.0"));
}

#[test]
fn test_missing_dependencies_are_all_reported() {
    let snapshot = RepositorySnapshot::from_modules([
        installed("app", "1.0.0", &[("ghost", "^1.0.0"), ("old", "^2.0.0")]),
        installed("old", "1.0.0", &[]),
    ]);

    let resolution = DependencyGraphResolver::new(&snapshot).resolve("app", &VersionRange::any());

    assert!(!resolution.is_success());
    assert_eq!(resolution.errors().len(), 2);
    assert!(resolution.contains("app"));
}

#[test]
fn test_cycle_is_reported_by_load_order() {
    let snapshot = RepositorySnapshot::from_modules([
        installed("a", "1.0.0", &[("b", "*")]),
        installed("b", "1.0.0", &[("a", "*")]),
    ]);

    let resolution = DependencyGraphResolver::new(&snapshot).resolve("a", &VersionRange::any());
    assert!(matches!(
        resolution.load_order(),
        Err(CjmodError::CircularDependency(_))
    ));
}

// ============================================================================
// 仓库
// ============================================================================

#[tokio::test]
async fn test_repository_index_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let repository = ModuleRepository::new(dir.path(), Vec::new());
    repository.register(installed("ui", "1.0.0", &[])).await;
    repository.register(installed("ui", "1.2.0", &[])).await;

    assert_eq!(repository.latest_version("ui").await, Some(v("1.2.0")));
    let found = repository.find_module("ui", &r("~1.0.0")).await.unwrap();
    assert_eq!(found.version(), &v("1.0.0"));

    let removed = repository.remove("ui", &v("1.2.0")).await.unwrap();
    assert_eq!(removed.version(), &v("1.2.0"));
    assert_eq!(repository.latest_version("ui").await, Some(v("1.0.0")));
    assert!(matches!(
        repository.remove("ui", &v("9.9.9")).await,
        Err(CjmodError::ModuleNotFound(_))
    ));
}
