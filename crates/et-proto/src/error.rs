//! et-proto エラー型

use thiserror::Error;

/// Protobuf エンコード/デコードのエラー
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Protobuf デコード失敗
    #[error("proto decode failed: {0}")]
    DecodeFailed(#[from] prost::DecodeError),
    /// 未知の ConnectStatus 値
    #[error("unknown connect status: {0}")]
    UnknownStatus(i32),
    /// 未知のパケット種別
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),
}
