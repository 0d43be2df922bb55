//! 应用配置：从 config/pilot.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PILOT__*` 覆盖（双下划线表示嵌套，如 `PILOT__AGENT__MAX_STEPS=10`）。
//! 凭证类的环境变量只在这里（进程边界）解析，组件构造时拿到的都是显式配置。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::cache::CacheMode;
use crate::llm::ModelProvider;

/// 应用配置根（对应 config/pilot.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSettings,
    pub cache: CacheSettings,
    pub remote: RemoteSettings,
    pub supervisor: SupervisorSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ViewportSettings {
    pub width: u32,
    pub height: u32,
}

impl Default for ViewportSettings {
    fn default() -> Self {
        Self {
            width: 1288,
            height: 711,
        }
    }
}

/// [agent] 段：步数上限、模型、超时、坐标与视口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_steps: u32,
    /// 未设置时由模型名前缀推断
    pub provider: Option<String>,
    pub model: String,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 截图超时（毫秒），不设置则不限时
    pub screenshot_timeout_ms: Option<u64>,
    /// 输出 [0,1] 归一化坐标的模型名片段
    pub normalized_models: Vec<String>,
    /// 无法实测视口时的兜底值
    pub viewport: ViewportSettings,
    /// 启用后固定使用该视口
    pub stealth_viewport: Option<ViewportSettings>,
    pub system_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 20,
            provider: None,
            model: "openai/computer-use-preview".to_string(),
            tool_timeout_secs: 30,
            screenshot_timeout_ms: Some(10_000),
            normalized_models: Vec::new(),
            viewport: ViewportSettings::default(),
            stealth_viewport: None,
            system_prompt: None,
        }
    }
}

impl AgentSettings {
    pub fn provider(&self) -> ModelProvider {
        match self.provider.as_deref() {
            Some(p) => ModelProvider::from_model_name(&format!("{}/", p)),
            None => ModelProvider::from_model_name(&self.model),
        }
    }
}

/// [cache] 段：回放缓存目录与模式；dir 未设置时使用进程内共享表
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dir: Option<PathBuf>,
    pub mode: CacheMode,
}

/// [remote] 段：远程执行服务
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// 显式指定时优先于 region
    pub base_url: Option<String>,
    pub region: Option<String>,
    /// region → base URL
    pub regions: HashMap<String, String>,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    /// 推理厂商的 API Key，随请求放在 x-model-api-key 头
    pub model_api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            region: None,
            regions: HashMap::new(),
            api_key: None,
            project_id: None,
            model_api_key: None,
            model: None,
            timeout_secs: Some(300),
        }
    }
}

/// [supervisor] 段：关闭守护进程的超时与轮询间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub kill_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub pid_poll_interval_ms: u64,
    /// 远程会话释放接口的 base URL
    pub release_url: Option<String>,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            kill_timeout_ms: 7_000,
            poll_interval_ms: 250,
            pid_poll_interval_ms: 500,
            release_url: None,
        }
    }
}

/// 按模型厂商查找 API Key 的环境变量名（按优先级）
fn model_key_env_names(provider: ModelProvider) -> &'static [&'static str] {
    match provider {
        ModelProvider::OpenAi => &["OPENAI_API_KEY"],
        ModelProvider::Anthropic => &["ANTHROPIC_API_KEY"],
        ModelProvider::Google => &["GOOGLE_GENERATIVE_AI_API_KEY", "GEMINI_API_KEY"],
        ModelProvider::Microsoft => &["AZURE_API_KEY"],
        ModelProvider::Other => &[],
    }
}

/// 解析模型 API Key：显式配置优先，其次按厂商查环境
///
/// lookup 由调用方注入（进程入口传 std::env::var），便于测试
pub fn resolve_model_api_key<F>(model: &str, explicit: Option<&str>, lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
        return Some(key.to_string());
    }
    let provider = ModelProvider::from_model_name(model);
    model_key_env_names(provider)
        .iter()
        .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()))
}

/// 从 config 目录加载配置，环境变量 PILOT__* 可覆盖
///
/// 1. 查找 config/pilot.toml、pilot.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/pilot", "pilot"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PILOT")
            .separator("__")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    let model = cfg
        .remote
        .model
        .clone()
        .unwrap_or_else(|| cfg.agent.model.clone());
    cfg.remote.model_api_key = resolve_model_api_key(
        &model,
        cfg.remote.model_api_key.as_deref(),
        |name| std::env::var(name).ok(),
    );
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_steps, 20);
        assert_eq!(cfg.agent.viewport, ViewportSettings { width: 1288, height: 711 });
        assert_eq!(cfg.supervisor.kill_timeout_ms, 7_000);
        assert_eq!(cfg.supervisor.poll_interval_ms, 250);
        assert_eq!(cfg.cache.mode, CacheMode::Persist);
        assert_eq!(cfg.agent.provider(), ModelProvider::OpenAi);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[agent]
max_steps = 7
model = "google/gemini-2.5-computer-use-preview"
normalized_models = ["qwen3-vl"]

[cache]
dir = "/tmp/pilot-cache"
mode = "buffer_latest"

[remote]
region = "eu"
model_api_key = "sk-explicit"

[remote.regions]
eu = "https://eu.remote.test/v1"
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.max_steps, 7);
        assert_eq!(cfg.agent.provider(), ModelProvider::Google);
        assert_eq!(cfg.cache.mode, CacheMode::BufferLatest);
        assert_eq!(cfg.remote.regions.get("eu").map(String::as_str), Some("https://eu.remote.test/v1"));
        assert_eq!(cfg.remote.model_api_key.as_deref(), Some("sk-explicit"));
        // 未在文件中出现的段使用默认值
        assert_eq!(cfg.supervisor.pid_poll_interval_ms, 500);
    }

    #[test]
    fn test_model_api_key_by_provider() {
        let env = |name: &str| match name {
            "GEMINI_API_KEY" => Some("g-key".to_string()),
            "ANTHROPIC_API_KEY" => Some("a-key".to_string()),
            _ => None,
        };
        assert_eq!(
            resolve_model_api_key("google/gemini-2.5-flash", None, env).as_deref(),
            Some("g-key")
        );
        assert_eq!(
            resolve_model_api_key("claude-sonnet-4", None, env).as_deref(),
            Some("a-key")
        );
        assert_eq!(resolve_model_api_key("openai/gpt-4.1", None, env), None);
        assert_eq!(
            resolve_model_api_key("openai/gpt-4.1", Some("sk-1"), env).as_deref(),
            Some("sk-1")
        );
    }
}
