//! ワイヤメッセージ定義
//!
//! すべて proto2 互換のフィールド番号を持つ。省略可能なフィールドは
//! `Option` で表し、`has_*` 相当の判定は `is_some()` で行う。

/// クライアント → サーバー: 接続要求
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(int32, tag = "2")]
    pub version: i32,
}

/// サーバー → クライアント: 接続応答
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
    /// `ConnectStatus` の数値
    #[prost(int32, tag = "1")]
    pub status: i32,
    #[prost(string, optional, tag = "2")]
    pub error: Option<String>,
}

/// 再接続時: 自分が受信済みの最後のシーケンス番号
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SequenceHeader {
    #[prost(int64, tag = "1")]
    pub sequence_number: i64,
}

/// 再接続時: 相手が取りこぼしたシリアライズ済みパケット列
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CatchupBuffer {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub buffer: Vec<Vec<u8>>,
}

/// 相手側にリスナーを開かせる要求
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortForwardSourceRequest {
    #[prost(int32, tag = "1")]
    pub source_port: i32,
    #[prost(int32, tag = "2")]
    pub destination_port: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortForwardSourceResponse {
    #[prost(string, optional, tag = "1")]
    pub error: Option<String>,
}

/// 宛先への接続要求
///
/// `fd` は要求元ローカルの未割り当てハンドルで、応答でそのまま返される。
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortForwardDestinationRequest {
    #[prost(int32, tag = "1")]
    pub port: i32,
    #[prost(int32, tag = "2")]
    pub fd: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortForwardDestinationResponse {
    #[prost(int32, tag = "1")]
    pub client_fd: i32,
    #[prost(int32, optional, tag = "2")]
    pub socket_id: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub error: Option<String>,
}

/// 多重化ソケット上のデータ
///
/// `buffer` / `closed` / `error` のいずれか 1 つだけが設定される。
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortForwardData {
    #[prost(int32, tag = "1")]
    pub socket_id: i32,
    /// true: ソース側リスナー → 宛先ハンドラ
    #[prost(bool, tag = "2")]
    pub source_to_destination: bool,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub buffer: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "4")]
    pub closed: Option<bool>,
    #[prost(string, optional, tag = "5")]
    pub error: Option<String>,
}

impl PortForwardData {
    pub fn with_buffer(socket_id: i32, source_to_destination: bool, buffer: Vec<u8>) -> Self {
        PortForwardData {
            socket_id,
            source_to_destination,
            buffer: Some(buffer),
            ..Default::default()
        }
    }

    pub fn with_closed(socket_id: i32, source_to_destination: bool) -> Self {
        PortForwardData {
            socket_id,
            source_to_destination,
            closed: Some(true),
            ..Default::default()
        }
    }

    pub fn with_error(socket_id: i32, source_to_destination: bool, error: impl Into<String>) -> Self {
        PortForwardData {
            socket_id,
            source_to_destination,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
