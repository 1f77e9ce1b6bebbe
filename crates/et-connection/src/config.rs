//! 接続設定
//!
//! JSON で読み込める。省略したフィールドは既定値になる。
//!
//! ```json
//! { "handshake_timeout_ms": 5000, "reconnect_interval_ms": 500 }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use et_transport::{DEFAULT_MAX_BACKLOG_BYTES, DEFAULT_MAX_FRAME_BYTES};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// `Connection` の動作パラメータ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// ハンドシェイクの各読み書きの上限
    pub handshake_timeout_ms: u64,
    /// 再接続試行の最小間隔
    pub reconnect_interval_ms: u64,
    /// 送信が途絶えてからハートビートを送るまで
    pub heartbeat_interval_ms: u64,
    /// 受信が途絶えてからソケットを死んだとみなすまで
    pub keepalive_timeout_ms: u64,
    /// 接続中に `write_packet` が再試行する間隔
    pub write_retry_interval_ms: u64,
    /// 切断中に `write_packet` が再試行する間隔
    pub disconnected_retry_interval_ms: u64,
    /// 受信フレームの最大長
    pub max_frame_bytes: usize,
    /// 再送用バックログの上限（暗号化済みバイト数）
    pub max_backlog_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            handshake_timeout_ms: 10_000,
            reconnect_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            keepalive_timeout_ms: 11_000,
            write_retry_interval_ms: 1,
            disconnected_retry_interval_ms: 100,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_backlog_bytes: DEFAULT_MAX_BACKLOG_BYTES,
        }
    }
}

impl ConnectionConfig {
    /// JSON ファイルから読み込む
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: ConnectionConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("handshake_timeout_ms must be positive".into()));
        }
        if self.keepalive_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "keepalive_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be positive".into()));
        }
        if self.max_backlog_bytes == 0 {
            return Err(ConfigError::Invalid("max_backlog_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn write_retry_interval(&self) -> Duration {
        Duration::from_millis(self.write_retry_interval_ms)
    }

    pub fn disconnected_retry_interval(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_interval_ms)
    }
}
