//! 目录加载器
//!
//! 开发期模块的目录结构：
//!
//! ```text
//! module.json    清单
//! src/           源码
//! lib/           依赖库，记入类路径
//! resources/     资源
//! build/         构建产物（过期时重新生成）
//! ```
//!
//! `src/` 中最新文件的修改时间晚于 `build/` 中最新文件时视为过期，执行外部构建命令。
//! 构建命令是参数模板，`{module}`、`{src}`、`{build}` 会被替换；命令的每行输出同时交给
//! 调用方回调和日志。构建成功后把 `src/` 中的非源码文件以及 `resources/` 复制到 `build/`。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{LoadedArtifact, ModuleLoader};
use crate::module::metadata::{LoadedModule, ModuleDescriptor};
use crate::module::parser::ManifestParser;
use crate::module::runtime::ModuleFactoryRegistry;
use crate::utils::{CjmodError, Result};

const SOURCE_DIR: &str = "src";
const LIB_DIR: &str = "lib";
const RESOURCES_DIR: &str = "resources";
const BUILD_DIR: &str = "build";

/// 构建失败时错误信息保留的输出行数
const FAILURE_TAIL_LINES: usize = 20;

/// 构建输出回调
pub type BuildOutput = Arc<dyn Fn(&str) + Send + Sync>;

/// 目录加载器
#[derive(Clone)]
pub struct DirectoryLoader {
    factories: Arc<ModuleFactoryRegistry>,
    build_command: Vec<String>,
    source_extensions: Vec<String>,
    output: Option<BuildOutput>,
}

impl Default for DirectoryLoader {
    fn default() -> Self {
        Self::new(Arc::new(ModuleFactoryRegistry::new()))
    }
}

impl DirectoryLoader {
    pub fn new(factories: Arc<ModuleFactoryRegistry>) -> Self {
        Self {
            factories,
            build_command: Vec::new(),
            source_extensions: vec!["cj".to_string(), "rs".to_string()],
            output: None,
        }
    }

    /// 构建命令模板，为空时只复制资源
    pub fn with_build_command(mut self, command: Vec<String>) -> Self {
        self.build_command = command;
        self
    }

    /// 源码扩展名，这些文件不会被复制到构建目录
    pub fn with_source_extensions(mut self, extensions: Vec<String>) -> Self {
        self.source_extensions = extensions;
        self
    }

    pub fn with_output(mut self, output: BuildOutput) -> Self {
        self.output = Some(output);
        self
    }

    /// 构建产物是否过期
    pub async fn needs_build(&self, dir: &Path) -> Result<bool> {
        let src = dir.join(SOURCE_DIR);
        let build = dir.join(BUILD_DIR);
        if !src.is_dir() {
            return Ok(false);
        }
        if !build.is_dir() {
            return Ok(true);
        }

        tokio::task::spawn_blocking(move || {
            let source = newest_modification(&src);
            let output = newest_modification(&build);
            match (source, output) {
                (Some(s), Some(o)) => s > o,
                (Some(_), None) => true,
                _ => false,
            }
        })
        .await
        .map_err(|e| CjmodError::Internal(format!("构建检查任务异常终止: {}", e)))
    }

    /// 执行构建
    pub async fn build(&self, dir: &Path, module: &str) -> Result<()> {
        let src = dir.join(SOURCE_DIR);
        let build = dir.join(BUILD_DIR);
        tokio::fs::create_dir_all(&build).await?;

        if !self.build_command.is_empty() {
            self.run_build_command(dir, module, &src, &build).await?;
        }

        let source_extensions = self.source_extensions.clone();
        let resources = dir.join(RESOURCES_DIR);
        let copied = tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut copied = copy_non_sources(&src, &build, &source_extensions)?;
            if resources.is_dir() {
                copied += copy_non_sources(&resources, &build, &[])?;
            }
            Ok(copied)
        })
        .await
        .map_err(|e| CjmodError::Internal(format!("资源复制任务异常终止: {}", e)))??;

        info!(module = %module, copied, "模块构建完成");
        Ok(())
    }

    fn expand(arg: &str, module: &str, src: &Path, build: &Path) -> String {
        arg.replace("{module}", module)
            .replace("{src}", &src.to_string_lossy())
            .replace("{build}", &build.to_string_lossy())
    }

    fn emit(&self, module: &str, line: &str, tail: &mut Vec<String>) {
        info!(module = %module, "[build] {}", line);
        if let Some(output) = &self.output {
            output(line);
        }
        tail.push(line.to_string());
        if tail.len() > FAILURE_TAIL_LINES {
            tail.remove(0);
        }
    }

    async fn run_build_command(&self, dir: &Path, module: &str, src: &Path, build: &Path) -> Result<()> {
        let argv: Vec<String> = self
            .build_command
            .iter()
            .map(|arg| Self::expand(arg, module, src, build))
            .collect();
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };
        debug!(module = %module, command = ?argv, "执行构建命令");

        let failure = |exit_code: Option<i32>, message: String| CjmodError::BuildFailure {
            module: module.to_string(),
            exit_code,
            message,
        };

        let mut child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failure(None, format!("无法启动构建命令 '{}': {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| failure(None, "无法读取构建输出".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| failure(None, "无法读取构建输出".to_string()))?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();

        let mut tail = Vec::new();
        let (mut stdout_done, mut stderr_done) = (false, false);
        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = stdout.next_line(), if !stdout_done => match line? {
                    Some(line) => self.emit(module, &line, &mut tail),
                    None => stdout_done = true,
                },
                line = stderr.next_line(), if !stderr_done => match line? {
                    Some(line) => self.emit(module, &line, &mut tail),
                    None => stderr_done = true,
                },
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(failure(status.code(), tail.join("\n")));
        }
        Ok(())
    }

    fn classpath(dir: &Path) -> Vec<String> {
        let mut classpath: Vec<PathBuf> = [BUILD_DIR, SOURCE_DIR, RESOURCES_DIR]
            .iter()
            .map(|d| dir.join(d))
            .filter(|p| p.is_dir())
            .collect();

        let lib = dir.join(LIB_DIR);
        if lib.is_dir() {
            let mut libs: Vec<PathBuf> = WalkDir::new(&lib)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect();
            libs.sort();
            classpath.extend(libs);
        }

        classpath
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }
}

fn newest_modification(dir: &Path) -> Option<SystemTime> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok()?.modified().ok())
        .max()
}

fn copy_non_sources(from: &Path, to: &Path, skip_extensions: &[String]) -> Result<u64> {
    if !from.is_dir() {
        return Ok(0);
    }
    let mut copied = 0;
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| CjmodError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_source = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| skip_extensions.iter().any(|s| s == ext));
        if is_source {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| CjmodError::Internal(e.to_string()))?;
        let target = to.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &target)?;
        copied += 1;
    }
    Ok(copied)
}

#[async_trait]
impl ModuleLoader for DirectoryLoader {
    fn loader_type(&self) -> &'static str {
        "directory"
    }

    fn can_load(&self, path: &Path) -> bool {
        path.is_dir() && ManifestParser::find_manifest(path).is_some()
    }

    async fn read_descriptor(&self, path: &Path) -> Result<ModuleDescriptor> {
        let manifest = ManifestParser::find_manifest(path)
            .ok_or_else(|| CjmodError::MissingManifest(path.to_path_buf()))?;
        ManifestParser::parse_file(&manifest).await
    }

    async fn load(&self, path: &Path) -> Result<LoadedArtifact> {
        let descriptor = self.read_descriptor(path).await?;

        let built = if self.needs_build(path).await? {
            info!(module = %descriptor.name, "源码已更新，开始构建");
            self.build(path, &descriptor.name).await?;
            true
        } else {
            false
        };

        let instance = self
            .factories
            .instantiate(&descriptor.name, &descriptor.entry_point)?;

        let mut module = LoadedModule::new(descriptor, path, self.loader_type());
        module
            .metadata
            .insert("development_mode".to_string(), Value::Bool(true));
        module
            .metadata
            .insert("classpath".to_string(), Value::from(Self::classpath(path)));
        if built {
            module
                .metadata
                .insert("last_build".to_string(), Value::String(Utc::now().to_rfc3339()));
        }

        info!(module = %module.name(), version = %module.version(), built, "目录模块已加载");
        Ok(LoadedArtifact { module, instance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::context::ExecutionContext;
    use crate::module::metadata::{FunctionParams, FunctionResult, FunctionSignature};
    use crate::module::runtime::CjmodModule;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Noop;

    #[async_trait]
    impl CjmodModule for Noop {
        fn functions(&self) -> Vec<FunctionSignature> {
            Vec::new()
        }

        async fn execute(
            &self,
            _function: &str,
            _params: FunctionParams,
            _context: &ExecutionContext,
        ) -> Result<FunctionResult> {
            Ok(FunctionResult::default())
        }
    }

    fn module_dir(root: &Path) -> PathBuf {
        let dir = root.join("widgets");
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        std::fs::create_dir_all(dir.join("resources")).unwrap();
        std::fs::write(
            dir.join("module.json"),
            r#"{"name":"widgets","version":"0.1.0","entryPoint":"widgets::Module"}"#,
        )
        .unwrap();
        std::fs::write(dir.join("src").join("main.cj"), "func main() {}").unwrap();
        std::fs::write(dir.join("src").join("template.html"), "<div/>").unwrap();
        std::fs::write(dir.join("lib").join("dep.cjlib"), "").unwrap();
        std::fs::write(dir.join("resources").join("icon.svg"), "<svg/>").unwrap();
        dir
    }

    fn loader(command: &[&str], lines: Arc<Mutex<Vec<String>>>) -> DirectoryLoader {
        let factories = Arc::new(ModuleFactoryRegistry::new());
        factories.register("widgets::Module", || Noop);
        DirectoryLoader::new(factories)
            .with_build_command(command.iter().map(|s| s.to_string()).collect())
            .with_output(Arc::new(move |line: &str| {
                lines.lock().unwrap().push(line.to_string())
            }))
    }

    #[tokio::test]
    async fn test_build_when_stale_then_skip() {
        let root = tempfile::tempdir().unwrap();
        let dir = module_dir(root.path());
        let lines = Arc::new(Mutex::new(Vec::new()));
        let loader = loader(
            &["sh", "-c", "echo compiling {module} && cp {src}/main.cj {build}/main.out"],
            Arc::clone(&lines),
        );

        assert!(loader.needs_build(&dir).await.unwrap());
        let artifact = loader.load(&dir).await.unwrap();

        assert_eq!(*lines.lock().unwrap(), vec!["compiling widgets"]);
        assert!(artifact.module.is_development());
        assert!(artifact.module.metadata.contains_key("last_build"));
        assert!(dir.join("build").join("main.out").is_file());
        assert!(dir.join("build").join("template.html").is_file());
        assert!(dir.join("build").join("icon.svg").is_file());
        assert!(!dir.join("build").join("main.cj").exists());

        let classpath = artifact.module.metadata["classpath"].as_array().unwrap();
        assert_eq!(classpath.len(), 4);
        assert!(classpath[3].as_str().unwrap().ends_with("dep.cjlib"));

        // 构建产物比源码新，不再构建
        let again = loader.load(&dir).await.unwrap();
        assert!(!again.module.metadata.contains_key("last_build"));
        assert_eq!(lines.lock().unwrap().len(), 1);

        // 修改源码
        let source = std::fs::File::options()
            .write(true)
            .open(dir.join("src").join("main.cj"))
            .unwrap();
        source
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        assert!(loader.needs_build(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn test_build_failure() {
        let root = tempfile::tempdir().unwrap();
        let dir = module_dir(root.path());
        let lines = Arc::new(Mutex::new(Vec::new()));
        let loader = loader(&["sh", "-c", "echo boom >&2; exit 3"], Arc::clone(&lines));

        match loader.load(&dir).await {
            Err(CjmodError::BuildFailure {
                module,
                exit_code,
                message,
            }) => {
                assert_eq!(module, "widgets");
                assert_eq!(exit_code, Some(3));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected result: {:?}", other.map(|a| a.module)),
        }
        assert_eq!(*lines.lock().unwrap(), vec!["boom"]);
    }

    #[tokio::test]
    async fn test_missing_program_is_build_failure() {
        let root = tempfile::tempdir().unwrap();
        let dir = module_dir(root.path());
        let loader = loader(&["definitely-not-a-real-build-tool"], Arc::new(Mutex::new(Vec::new())));

        assert!(matches!(
            loader.build(&dir, "widgets").await,
            Err(CjmodError::BuildFailure { exit_code: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_can_load_requires_manifest() {
        let root = tempfile::tempdir().unwrap();
        let loader = DirectoryLoader::default();
        assert!(!loader.can_load(root.path()));
        let dir = module_dir(root.path());
        assert!(loader.can_load(&dir));
        assert!(!loader.needs_build(root.path()).await.unwrap());
    }
}
