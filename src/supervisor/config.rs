//! 守护进程配置：启动时一次性交付，之后最多重新装配一次

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{AppConfig, SupervisorSection};
use crate::stream::resolve_base_url;

/// 需要清理的资源；同一时刻只有一个变体生效
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorConfig {
    /// 本地启动的浏览器进程
    Local {
        pid: u32,
        #[serde(rename = "userDataDir", default, skip_serializing_if = "Option::is_none")]
        user_data_dir: Option<PathBuf>,
        /// 本次运行是否创建了临时 profile 目录
        #[serde(rename = "createdTempProfile", default)]
        created_temp_profile: bool,
        #[serde(rename = "preserveUserDataDir", default)]
        preserve_user_data_dir: bool,
    },
    /// 远程浏览器会话
    Remote {
        #[serde(rename = "apiKey")]
        api_key: String,
        #[serde(rename = "projectId")]
        project_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl SupervisorConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorConfig::Local { .. } => "LOCAL",
            SupervisorConfig::Remote { .. } => "REMOTE",
        }
    }
}

/// 清理时序参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorSettings {
    pub kill_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub pid_poll_interval_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_base_url: Option<String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            kill_timeout_ms: 7_000,
            poll_interval_ms: 250,
            pid_poll_interval_ms: 500,
            release_base_url: None,
        }
    }
}

impl From<&SupervisorSection> for SupervisorSettings {
    fn from(section: &SupervisorSection) -> Self {
        Self {
            kill_timeout_ms: section.kill_timeout_ms,
            poll_interval_ms: section.poll_interval_ms,
            pid_poll_interval_ms: section.pid_poll_interval_ms,
            release_base_url: section.release_url.clone(),
        }
    }
}

impl SupervisorSettings {
    /// 未显式配置 release_url 时回落到远程执行服务的 base URL
    pub fn from_config(config: &AppConfig) -> Self {
        let mut settings = Self::from(&config.supervisor);
        if settings.release_base_url.is_none() {
            settings.release_base_url = resolve_base_url(&config.remote).ok();
        }
        settings
    }
}

/// `--supervisor-config=<json>` 的内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorPayload {
    pub config: SupervisorConfig,
    #[serde(default)]
    pub settings: SupervisorSettings,
}

impl SupervisorPayload {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            settings: SupervisorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_wire_shape() {
        let payload: SupervisorPayload = serde_json::from_str(
            r#"{"config":{"kind":"LOCAL","pid":4242,"userDataDir":"/tmp/profile-1","createdTempProfile":true}}"#,
        )
        .unwrap();
        assert_eq!(
            payload.config,
            SupervisorConfig::Local {
                pid: 4242,
                user_data_dir: Some(PathBuf::from("/tmp/profile-1")),
                created_temp_profile: true,
                preserve_user_data_dir: false,
            }
        );
        assert_eq!(payload.settings.kill_timeout_ms, 7_000);
    }

    #[test]
    fn test_remote_wire_shape() {
        let config = SupervisorConfig::Remote {
            api_key: "k".into(),
            project_id: "p".into(),
            session_id: "s".into(),
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "REMOTE");
        assert_eq!(json["sessionId"], "s");
        assert_eq!(config.kind(), "REMOTE");
    }

    #[test]
    fn test_release_url_falls_back_to_remote_base() {
        let mut config = AppConfig::default();
        assert_eq!(SupervisorSettings::from_config(&config).release_base_url, None);

        config.remote.base_url = Some("https://remote.test/v1/".to_string());
        config.supervisor.kill_timeout_ms = 1_500;
        let settings = SupervisorSettings::from_config(&config);
        assert_eq!(settings.release_base_url.as_deref(), Some("https://remote.test/v1"));
        assert_eq!(settings.kill_timeout_ms, 1_500);

        config.supervisor.release_url = Some("https://release.test".to_string());
        assert_eq!(
            SupervisorSettings::from_config(&config).release_base_url.as_deref(),
            Some("https://release.test")
        );
    }

    #[test]
    fn test_settings_camel_case() {
        let settings: SupervisorSettings =
            serde_json::from_str(r#"{"killTimeoutMs":500,"pollIntervalMs":50}"#).unwrap();
        assert_eq!(settings.kill_timeout_ms, 500);
        assert_eq!(settings.pid_poll_interval_ms, 500);
    }
}
