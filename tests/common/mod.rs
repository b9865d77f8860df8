//! 集成测试公共工具

#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cjmod_runtime::module::{InitContext, LoadedModule};
use cjmod_runtime::{
    CjmodError, CjmodModule, ErrorCategory, ErrorLevel, ExecutionContext, FunctionParams,
    FunctionResult, FunctionSignature, LifecycleListener, ModuleFactoryRegistry, ModuleFault,
    Parameter, Result,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

/// 测试模块的入口点
pub const FIXTURE_ENTRY: &str = "test.Fixture";

/// 测试模块
///
/// - `echo(text)` 原样返回
/// - `read(path)` 通过执行上下文读取资源
/// - `slow(ms)` 睡眠指定毫秒
/// - `fatal()` 返回致命故障
/// - `spawn(marker, child_ms, wait_ms)` 派生任务，`child_ms` 后写入标记文件，自身等待 `wait_ms`
pub struct FixtureModule {
    pub initialized: Arc<AtomicUsize>,
}

#[async_trait]
impl CjmodModule for FixtureModule {
    fn functions(&self) -> Vec<FunctionSignature> {
        vec![
            FunctionSignature::new("echo", vec![Parameter::required("text", "string")]),
            FunctionSignature::new("read", vec![Parameter::required("path", "string")]),
            FunctionSignature::new("slow", vec![Parameter::required("ms", "number")]),
            FunctionSignature::new("fatal", Vec::new()),
            FunctionSignature::new(
                "spawn",
                vec![
                    Parameter::required("marker", "string"),
                    Parameter::required("child_ms", "number"),
                    Parameter::required("wait_ms", "number"),
                ],
            ),
        ]
    }

    async fn initialize(&self, _context: &InitContext) -> Result<()> {
        // 拉长初始化窗口，便于并发加载测试
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(
        &self,
        function: &str,
        params: FunctionParams,
        context: &ExecutionContext,
    ) -> Result<FunctionResult> {
        match function {
            "echo" => Ok(FunctionResult::new(params["text"].clone())),
            "read" => {
                let path = params["path"].as_str().unwrap_or_default().to_string();
                let content = context.load_resource_string(&path).await?;
                Ok(FunctionResult::new(json!(content)))
            }
            "slow" => {
                let ms = params["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(FunctionResult::new(json!("done")))
            }
            "spawn" => {
                let marker = PathBuf::from(params["marker"].as_str().unwrap_or_default());
                let child_ms = params["child_ms"].as_u64().unwrap_or(0);
                let wait_ms = params["wait_ms"].as_u64().unwrap_or(0);
                context.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(child_ms)).await;
                    let _ = tokio::fs::write(&marker, "done").await;
                })?;
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                Ok(FunctionResult::new(json!("spawned")))
            }
            "fatal" => Err(CjmodError::Fault(ModuleFault::new(
                context.module(),
                ErrorCategory::Execution,
                ErrorLevel::Fatal,
                "模块内部状态损坏",
            ))),
            other => Err(CjmodError::FunctionNotFound {
                module: context.module().to_string(),
                function: other.to_string(),
            }),
        }
    }
}

/// 注册测试模块入口点，返回初始化计数器
pub fn fixture_factories() -> (Arc<ModuleFactoryRegistry>, Arc<AtomicUsize>) {
    let factories = Arc::new(ModuleFactoryRegistry::new());
    let initialized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&initialized);
    factories.register(FIXTURE_ENTRY, move || FixtureModule {
        initialized: Arc::clone(&counter),
    });
    (factories, initialized)
}

/// 生成清单内容
pub fn manifest(name: &str, version: &str, dependencies: &str) -> String {
    json!({
        "name": name,
        "version": version,
        "entryPoint": FIXTURE_ENTRY,
        "dependencies": dependencies,
    })
    .to_string()
}

/// 在 `root/name` 下创建目录模块
pub fn write_directory_module(root: &Path, name: &str, version: &str, dependencies: &str) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("module.json"), manifest(name, version, dependencies)).unwrap();
    dir
}

/// 创建 tar.gz 模块归档
pub fn write_archive(path: &Path, files: &[(&str, &[u8])]) {
    let file = File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// 记录生命周期事件
#[derive(Default)]
pub struct EventRecorder {
    pub events: Mutex<Vec<String>>,
}

impl EventRecorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl LifecycleListener for EventRecorder {
    fn on_activated(&self, module: &LoadedModule) {
        self.events.lock().unwrap().push(format!("activated:{}", module.name()));
    }

    fn on_suspended(&self, module: &LoadedModule) {
        self.events.lock().unwrap().push(format!("suspended:{}", module.name()));
    }

    fn on_unloaded(&self, module: &LoadedModule) {
        self.events.lock().unwrap().push(format!("unloaded:{}", module.name()));
    }

    fn on_error(&self, module: &str, fault: &ModuleFault) {
        self.events
            .lock()
            .unwrap()
            .push(format!("error:{}:{}", module, fault.level));
    }
}

/// 构造参数表
pub fn params(pairs: &[(&str, serde_json::Value)]) -> FunctionParams {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
