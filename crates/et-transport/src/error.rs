//! et-transport エラー型

use std::io;

use et_crypto::CryptoError;
use thiserror::Error;

/// トランスポート層のエラー
#[derive(Debug, Error)]
pub enum TransportError {
    /// パケットが短すぎる
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    /// 既に暗号化済みのパケットを再暗号化しようとした
    #[error("packet is already encrypted")]
    AlreadyEncrypted,
    /// 平文パケットを復号しようとした
    #[error("packet is not encrypted")]
    NotEncrypted,
    /// フレーム長が上限を超えた
    #[error("frame of {length} bytes exceeds limit of {limit}")]
    FrameTooLarge { length: usize, limit: usize },
    /// 期待より先のシーケンス番号を受信した（欠落）
    #[error("sequence gap: expected {expected}, got {actual}")]
    SequenceGap { expected: i64, actual: i64 },
    /// 相手が自分の送信済み番号より先を受信済みと主張した
    #[error("peer claims sequence {peer} but only {local} were written")]
    PeerAhead { peer: i64, local: i64 },
    /// 要求された範囲が既に破棄済み
    #[error("backlog no longer holds sequence {requested} (oldest retained {oldest})")]
    BacklogExhausted { requested: i64, oldest: i64 },
    /// ソケットが生きているうちに recover を呼んだ
    #[error("recover requires the socket to be invalidated first")]
    SocketStillAlive,
    /// 暗号エラー（認証失敗を含む）
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// ソケット I/O エラー
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// 接続そのものを終わらせるべきエラーか
    ///
    /// `Io` はソケットの切断であり、再接続で回復できる。
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
