//! # et-proto
//!
//! ハンドシェイク・再接続・ポートフォワードで使う Protobuf メッセージと
//! エンコード/デコードユーティリティ。
//!
//! ## ソケット上の形式
//!
//! ```text
//! 制御メッセージ: [length: u32 BE][protobuf bytes]
//! データパケット: [length: u32 BE][encrypted: u8][header: u8][payload...]
//! ```
//!
//! 制御メッセージはハンドシェイク（接続直後）と再接続ハンドシェイクの間だけ
//! 流れるため、データパケットと同じストリーム上でも順序で区別できる。
//! ポートフォワードのメッセージはデータパケットのペイロードに載る。

pub mod error;
pub mod messages;

use prost::Message;

pub use error::ProtoError;
pub use messages::{
    CatchupBuffer, ConnectRequest, ConnectResponse, PortForwardData, PortForwardDestinationRequest,
    PortForwardDestinationResponse, PortForwardSourceRequest, PortForwardSourceResponse,
    SequenceHeader,
};

/// ハンドシェイクのプロトコルバージョン
pub const PROTOCOL_VERSION: i32 = 6;

/// 接続応答のステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectStatus {
    NewClient = 1,
    ReturningClient = 2,
    InvalidKey = 3,
    MismatchedProtocol = 4,
}

impl TryFrom<i32> for ConnectStatus {
    type Error = ProtoError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ConnectStatus::NewClient),
            2 => Ok(ConnectStatus::ReturningClient),
            3 => Ok(ConnectStatus::InvalidKey),
            4 => Ok(ConnectStatus::MismatchedProtocol),
            other => Err(ProtoError::UnknownStatus(other)),
        }
    }
}

/// データパケットのヘッダ（1 バイトの種別タグ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    KeepAlive = 0,
    PortForwardData = 3,
    PortForwardSourceRequest = 4,
    PortForwardSourceResponse = 5,
    PortForwardDestinationRequest = 6,
    PortForwardDestinationResponse = 7,
    Heartbeat = 254,
}

impl PacketType {
    /// ポートフォワード系のパケットか
    pub fn is_port_forward(self) -> bool {
        matches!(
            self,
            PacketType::PortForwardData
                | PacketType::PortForwardSourceRequest
                | PacketType::PortForwardSourceResponse
                | PacketType::PortForwardDestinationRequest
                | PacketType::PortForwardDestinationResponse
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::KeepAlive),
            3 => Ok(PacketType::PortForwardData),
            4 => Ok(PacketType::PortForwardSourceRequest),
            5 => Ok(PacketType::PortForwardSourceResponse),
            6 => Ok(PacketType::PortForwardDestinationRequest),
            7 => Ok(PacketType::PortForwardDestinationResponse),
            254 => Ok(PacketType::Heartbeat),
            other => Err(ProtoError::UnknownPacketType(other)),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        value as u8
    }
}

impl ConnectRequest {
    /// 現在のプロトコルバージョンで接続要求を組み立てる
    pub fn new(client_id: impl Into<String>) -> Self {
        ConnectRequest {
            client_id: client_id.into(),
            version: PROTOCOL_VERSION,
        }
    }
}

impl ConnectResponse {
    pub fn new(status: ConnectStatus) -> Self {
        ConnectResponse {
            status: status as i32,
            error: None,
        }
    }

    pub fn with_error(status: ConnectStatus, error: impl Into<String>) -> Self {
        ConnectResponse {
            status: status as i32,
            error: Some(error.into()),
        }
    }

    /// ステータスを列挙型として取り出す
    pub fn connect_status(&self) -> Result<ConnectStatus, ProtoError> {
        ConnectStatus::try_from(self.status)
    }
}

/// メッセージをバイト列にエンコードする
pub fn encode_to_bytes<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

/// バイト列からメッセージをデコードする
///
/// # エラー
/// - `ProtoError::DecodeFailed`: protobuf デコード失敗
pub fn decode_from_bytes<M: Message + Default>(bytes: &[u8]) -> Result<M, ProtoError> {
    Ok(M::decode(bytes)?)
}
