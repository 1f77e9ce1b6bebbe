//! セッション Nonce 実装
//!
//! ## Nonce 構造（12バイト）
//! ```text
//! bytes[0]     = direction (ToServer=0, ToClient=1)
//! bytes[1..4]  = 0x000000    (ゼロパディング)
//! bytes[4..12] = counter as u64, big-endian
//! ```
//!
//! 暗号文の先頭には nonce の後半 8 バイト（カウンタ）のみ載せる。
//! 方向バイトは受信側の `CryptoHandler` が自分で補う。

use crate::Direction;

/// 暗号文の先頭に載るカウンタ部分のバイト数
pub const COUNTER_LEN: usize = 8;

/// 方向付き Nonce（12バイト）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionNonce([u8; 12]);

impl SessionNonce {
    /// 方向とカウンタから Nonce を構築する
    ///
    /// # 例
    /// ```
    /// use et_crypto::{Direction, SessionNonce};
    /// let nonce = SessionNonce::new(Direction::ToClient, 42);
    /// assert_eq!(nonce.counter(), 42);
    /// assert_eq!(nonce.direction(), Direction::ToClient);
    /// ```
    pub fn new(direction: Direction, counter: u64) -> Self {
        let mut bytes = [0u8; 12];
        bytes[0] = direction as u8;
        bytes[4..12].copy_from_slice(&counter.to_be_bytes());
        SessionNonce(bytes)
    }

    /// 暗号文の先頭 8 バイトから Nonce を復元する
    ///
    /// 8 バイトに満たない場合は `None`。
    pub fn from_wire_prefix(direction: Direction, bytes: &[u8]) -> Option<Self> {
        let counter = read_counter(bytes)?;
        Some(Self::new(direction, counter))
    }

    /// カウンタ値
    pub fn counter(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[4..12]);
        u64::from_be_bytes(buf)
    }

    pub fn direction(&self) -> Direction {
        if self.0[0] == 0 {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    /// AES-OCB3 の nonce 引数として使う 12 バイト
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// 暗号文の先頭に埋め込む 8 バイト
    pub fn tail_bytes(&self) -> &[u8] {
        &self.0[4..12]
    }
}

/// 暗号文先頭のカウンタを読む（復号はしない）
pub(crate) fn read_counter(bytes: &[u8]) -> Option<u64> {
    let head = bytes.get(..COUNTER_LEN)?;
    let mut buf = [0u8; COUNTER_LEN];
    buf.copy_from_slice(head);
    Some(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_layout() {
        let nonce = SessionNonce::new(Direction::ToClient, 1);
        assert_eq!(nonce.as_bytes()[0], 1);
        assert_eq!(&nonce.as_bytes()[1..4], &[0u8; 3]);
        assert_eq!(nonce.counter(), 1);
    }

    #[test]
    fn test_directions_never_collide() {
        let a = SessionNonce::new(Direction::ToServer, 7);
        let b = SessionNonce::new(Direction::ToClient, 7);
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.tail_bytes(), b.tail_bytes());
    }

    #[test]
    fn test_from_wire_prefix() {
        let original = SessionNonce::new(Direction::ToServer, 0xDEADBEEFCAFEBABE);
        let mut wire = original.tail_bytes().to_vec();
        wire.extend_from_slice(b"ciphertext");

        let restored = SessionNonce::from_wire_prefix(Direction::ToServer, &wire).unwrap();
        assert_eq!(restored, original);
        assert!(SessionNonce::from_wire_prefix(Direction::ToServer, &[0u8; 7]).is_none());
    }
}
