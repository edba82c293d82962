//! Hub 配置（TOML）
//!
//! ```toml
//! log_dir = "logs"
//!
//! [broker]
//! host = "192.168.1.20"
//! port = 1883
//!
//! [perception]
//! source = "test-pattern"
//! cycle_delay_ms = 33
//! confidence_threshold = 0.5
//!
//! [server]
//! ws_addr = "0.0.0.0:8765"
//!
//! [recorder]
//! path = "data/dataset.csv"
//! ```
//!
//! 所有字段都有默认值，空文件即为默认配置。

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use smartarm_client::MqttSettings;
use smartarm_driver::PerceptionConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// 帧来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// 合成测试图案 + 脚本化检测器
    #[default]
    TestPattern,
    /// 不启动感知线程
    None,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PerceptionSection {
    pub source: SourceKind,
    pub frame_width: u32,
    pub frame_height: u32,
    #[serde(flatten)]
    pub tuning: PerceptionConfig,
}

impl Default for PerceptionSection {
    fn default() -> Self {
        Self {
            source: SourceKind::TestPattern,
            frame_width: 640,
            frame_height: 480,
            tuning: PerceptionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// WebSocket 监听地址
    pub ws_addr: String,
    /// 每个订阅者的待发送消息上限，超出即视为投递失败
    pub subscriber_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            ws_addr: "0.0.0.0:8765".to_string(),
            subscriber_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecorderSection {
    pub enabled: bool,
    pub path: PathBuf,
    pub queue_capacity: usize,
}

impl Default for RecorderSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("data/dataset.csv"),
            queue_capacity: 1024,
        }
    }
}

/// Hub 完整配置
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// 日志文件目录（按天轮转），未设置时只输出到控制台
    pub log_dir: Option<PathBuf>,
    pub broker: MqttSettings,
    pub perception: PerceptionSection,
    pub server: ServerSection,
    pub recorder: RecorderSection,
}

impl HubConfig {
    /// 从 TOML 文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: HubConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// 检查取值合法性
    pub fn validate(&self) -> Result<()> {
        self.ws_socket_addr()?;
        if self.server.subscriber_buffer == 0 {
            bail!("server.subscriber_buffer must be greater than 0");
        }
        if self.perception.source != SourceKind::None
            && (self.perception.frame_width == 0 || self.perception.frame_height == 0)
        {
            bail!("perception frame size must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.perception.tuning.confidence_threshold) {
            bail!(
                "perception.confidence_threshold must be within 0.0..=1.0, got {}",
                self.perception.tuning.confidence_threshold
            );
        }
        if self.broker.host.is_empty() {
            bail!("broker.host must not be empty");
        }
        Ok(())
    }

    pub fn ws_socket_addr(&self) -> Result<SocketAddr> {
        self.server
            .ws_addr
            .parse()
            .with_context(|| format!("Invalid server.ws_addr '{}'", self.server.ws_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = HubConfig::from_toml_str("").unwrap();
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.status_topic, "smartarm/status");
        assert_eq!(config.perception.tuning.cycle_delay_ms, 33);
        assert_eq!(config.server.ws_addr, "0.0.0.0:8765");
        assert!(config.recorder.enabled);
        assert!(config.log_dir.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_sections() {
        let config = HubConfig::from_toml_str(
            r#"
            log_dir = "logs"

            [broker]
            host = "10.0.0.5"

            [perception]
            source = "none"
            confidence_threshold = 0.7
            target_classes = []

            [server]
            ws_addr = "127.0.0.1:9000"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_dir, Some(PathBuf::from("logs")));
        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.perception.source, SourceKind::None);
        assert_eq!(config.perception.tuning.confidence_threshold, 0.7);
        assert!(config.perception.tuning.target_classes.is_empty());
        assert_eq!(config.perception.tuning.join_timeout_ms, 2000);
        assert_eq!(config.ws_socket_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HubConfig::default();
        config.server.ws_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.server.subscriber_buffer = 0;
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.perception.tuning.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_source_rejected() {
        assert!(HubConfig::from_toml_str("[perception]\nsource = \"usb-camera\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        std::fs::write(&path, "[recorder]\nenabled = false\n").unwrap();

        let config = HubConfig::load(&path).unwrap();
        assert!(!config.recorder.enabled);
        assert!(HubConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
