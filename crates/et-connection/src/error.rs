//! et-connection エラー型

use std::io;

use et_crypto::CryptoError;
use et_proto::{ConnectStatus, ProtoError};
use et_transport::TransportError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// ハンドシェイク中のソケットエラー
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// 致命的なトランスポートエラー（認証失敗・欠落など）
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// サーバーが接続を拒否した
    #[error("server rejected connection with {status:?}: {message}")]
    Rejected { status: ConnectStatus, message: String },
    /// 登録済み ID に別のパスキーを登録しようとした
    #[error("passkey mismatch for client {0}")]
    PasskeyMismatch(String),
    /// 再接続先でセッションが破棄されていた
    #[error("session terminated by peer")]
    SessionTerminated,
    #[error("connection is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
