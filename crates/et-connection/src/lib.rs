//! # et-connection
//!
//! 切断をまたいで続くクライアント / サーバー間のコネクション。
//!
//! ## 構成
//!
//! ```text
//! ClientConnection ──┐
//!                    ├── Connection（BackedReader + BackedWriter + 再接続戦略）
//! ServerClientConnection ┘
//!
//! ServerConnection: 待ち受け・接続ハンドシェイク・クライアント表の管理
//! ```
//!
//! ## 接続の流れ
//!
//! ```text
//! 1. client: ConnectRequest → server: ConnectResponse
//! 2. NEW_CLIENT       → 新しい ServerClientConnection を作り受け入れ判断へ
//!    RETURNING_CLIENT → 双方で SequenceHeader / CatchupBuffer を交換して再開
//! 3. 以降は暗号化済みパケットのストリーム
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod server;
pub mod server_client;

pub use client::{ClientConnection, ClientRedial};
pub use config::{ConfigError, ConnectionConfig};
pub use connection::{
    Connection, ConnectionState, ConnectionStats, ReconnectStrategy, RedialOutcome, Role, WaitForPeer,
};
pub use error::{ConnectionError, Result};
pub use server::{AcceptAll, ClientAdmission, ServerConnection, SharedClientConnection};
pub use server_client::{write_shared_packet, ServerClientConnection};
