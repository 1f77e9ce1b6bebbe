//! et-forward エラー型

use std::io;

use et_proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    /// ローカルの待ち受けソケットを作れない
    #[error("could not listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("invalid port number {0}")]
    InvalidPort(i32),
    #[error("Could not find empty socket id")]
    SocketIdsExhausted,
    /// 相手側でリバーストンネルを開けなかった
    #[error("reverse tunnel request failed: {0}")]
    ReverseTunnelFailed(String),
    #[error("unexpected packet type {0} for port forwarding")]
    UnexpectedPacket(u8),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, ForwardError>;
