//! # et-crypto
//!
//! AES-256-OCB3 によるパケット暗号化
//!
//! セッションごとの共有パスキー（32バイト）を鍵にし、
//! 方向ごとに独立した nonce 空間を持つ `CryptoHandler` を提供する。
//!
//! ## 暗号化仕様
//!
//! ```text
//! 暗号文:
//!   [counter: u64 BE][ciphertext + auth_tag(16)]
//!
//! Nonce（12バイト）:
//!   bytes[0]     = direction (TO_SERVER=0, TO_CLIENT=1)
//!   bytes[1..4]  = 0 (ゼロパディング)
//!   bytes[4..12] = counter as u64, big-endian（暗号文の先頭に載る）
//! ```

mod error;
mod handler;
mod keys;
mod nonce;

pub use error::CryptoError;
pub use handler::{CryptoHandler, KEY_LEN, TAG_LEN};
pub use keys::{generate_client_id, generate_passkey, random_alphanumeric, CLIENT_ID_LEN};
pub use nonce::{SessionNonce, COUNTER_LEN};

/// パケットの方向（nonce の先頭バイト）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// クライアント → サーバー
    ToServer = 0,
    /// サーバー → クライアント
    ToClient = 1,
}

impl Direction {
    /// 逆方向
    pub fn reverse(self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}
