//! AES-256-OCB3 方向別暗号ハンドラ
//!
//! 1 つの `Connection` は送信用と受信用の 2 つの `CryptoHandler` を持つ。
//! 両者は同じ鍵を共有するが、nonce の先頭バイト（方向）が異なるため
//! 双方がカウンタ 0 から始めても nonce は衝突しない。

use aead::{Aead, KeyInit, Payload};
use aes::Aes256;
use ocb3::Ocb3;

use crate::error::CryptoError;
use crate::nonce::{read_counter, SessionNonce, COUNTER_LEN};
use crate::Direction;

/// AES-256-OCB3 (12バイト nonce, 16バイト tag) の型エイリアス
type Aes256Ocb3 = Ocb3<Aes256>;

/// 鍵長（バイト）
pub const KEY_LEN: usize = 32;
/// 認証タグ長（バイト）
pub const TAG_LEN: usize = 16;

/// 方向別の暗号ハンドラ
///
/// ## 暗号文の構造
/// ```text
/// [counter: u64 BE][ciphertext + auth_tag: variable]
/// ```
pub struct CryptoHandler {
    cipher: Aes256Ocb3,
    direction: Direction,
    /// 次の暗号化で使うカウンタ
    counter: u64,
}

impl CryptoHandler {
    /// 32 バイトの鍵と方向からハンドラを初期化する
    ///
    /// # エラー
    /// - `CryptoError::InvalidKeyLength`: 鍵長が 32 バイト以外
    pub fn new(key: &[u8], direction: Direction) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: key.len(),
            });
        }
        let cipher = Aes256Ocb3::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: key.len(),
        })?;
        Ok(CryptoHandler {
            cipher,
            direction,
            counter: 0,
        })
    }

    /// 平文を暗号化し、カウンタを進める
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt_with_associated_data(plaintext, &[])
    }

    /// 追加認証データ付きで暗号化する
    ///
    /// `aad` は暗号化されないが改ざんは検出される（パケットヘッダ用）。
    pub fn encrypt_with_associated_data(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let counter = self.counter;
        let next = counter.checked_add(1).ok_or(CryptoError::CounterExhausted)?;
        let nonce = SessionNonce::new(self.direction, counter);

        let ciphertext = self
            .cipher
            .encrypt(nonce.as_bytes().into(), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)?;
        self.counter = next;

        let mut out = Vec::with_capacity(COUNTER_LEN + ciphertext.len());
        out.extend_from_slice(nonce.tail_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// 暗号文を復号する
    ///
    /// nonce は暗号文の先頭から取り出すため、送信側のカウンタと
    /// 同期している必要はない。
    ///
    /// # エラー
    /// - `CryptoError::CiphertextTooShort`: カウンタ + タグに満たない
    /// - `CryptoError::DecryptionFailed`: 認証タグ検証失敗
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_with_associated_data(ciphertext, &[])
    }

    pub fn decrypt_with_associated_data(
        &self,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < COUNTER_LEN + TAG_LEN {
            return Err(CryptoError::CiphertextTooShort(ciphertext.len()));
        }
        let nonce = SessionNonce::from_wire_prefix(self.direction, ciphertext)
            .ok_or(CryptoError::CiphertextTooShort(ciphertext.len()))?;

        self.cipher
            .decrypt(
                nonce.as_bytes().into(),
                Payload {
                    msg: &ciphertext[COUNTER_LEN..],
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// 暗号文に載っているカウンタを復号せずに読む
    pub fn carried_counter(ciphertext: &[u8]) -> Option<u64> {
        read_counter(ciphertext)
    }

    /// 次に使うカウンタ値
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl core::fmt::Debug for CryptoHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CryptoHandler")
            .field("direction", &self.direction)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"12345678901234567890123456789012";

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let mut sender = CryptoHandler::new(KEY, Direction::ToServer).unwrap();
        let receiver = CryptoHandler::new(KEY, Direction::ToServer).unwrap();

        let message = b"ET Phone Home";
        let ciphertext = sender.encrypt(message).unwrap();
        assert_ne!(&ciphertext[COUNTER_LEN..], message.as_slice());

        let plaintext = receiver.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, message);
    }

    #[test]
    fn test_counter_increments() {
        let mut handler = CryptoHandler::new(KEY, Direction::ToClient).unwrap();
        assert_eq!(handler.counter(), 0);
        let first = handler.encrypt(b"a").unwrap();
        let second = handler.encrypt(b"a").unwrap();
        assert_eq!(handler.counter(), 2);
        assert_eq!(CryptoHandler::carried_counter(&first), Some(0));
        assert_eq!(CryptoHandler::carried_counter(&second), Some(1));
        assert_ne!(first, second);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut sender = CryptoHandler::new(KEY, Direction::ToServer).unwrap();
        let receiver = CryptoHandler::new(KEY, Direction::ToServer).unwrap();

        let mut ciphertext = sender.encrypt(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert_eq!(receiver.decrypt(&ciphertext), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_wrong_direction_fails() {
        let mut sender = CryptoHandler::new(KEY, Direction::ToServer).unwrap();
        let receiver = CryptoHandler::new(KEY, Direction::ToClient).unwrap();

        let ciphertext = sender.encrypt(b"payload").unwrap();
        assert_eq!(receiver.decrypt(&ciphertext), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_associated_data_is_authenticated() {
        let mut sender = CryptoHandler::new(KEY, Direction::ToServer).unwrap();
        let receiver = CryptoHandler::new(KEY, Direction::ToServer).unwrap();

        let ciphertext = sender.encrypt_with_associated_data(b"body", &[3]).unwrap();
        assert!(receiver.decrypt_with_associated_data(&ciphertext, &[3]).is_ok());
        assert_eq!(
            receiver.decrypt_with_associated_data(&ciphertext, &[4]),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_invalid_key_length() {
        let result = CryptoHandler::new(b"short", Direction::ToServer);
        assert_eq!(
            result.unwrap_err(),
            CryptoError::InvalidKeyLength { expected: 32, actual: 5 }
        );
    }

    #[test]
    fn test_too_short_ciphertext() {
        let receiver = CryptoHandler::new(KEY, Direction::ToServer).unwrap();
        assert_eq!(
            receiver.decrypt(&[0u8; 10]),
            Err(CryptoError::CiphertextTooShort(10))
        );
    }

    #[test]
    fn test_empty_plaintext() {
        let mut sender = CryptoHandler::new(KEY, Direction::ToServer).unwrap();
        let receiver = CryptoHandler::new(KEY, Direction::ToServer).unwrap();
        let ciphertext = sender.encrypt(b"").unwrap();
        assert_eq!(ciphertext.len(), COUNTER_LEN + TAG_LEN);
        assert!(receiver.decrypt(&ciphertext).unwrap().is_empty());
    }
}
