//! 暗号エラー型

use thiserror::Error;

/// 暗号操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// 鍵の長さが不正（32バイト以外）
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    /// 暗号化に失敗
    #[error("encryption failed")]
    EncryptionFailed,
    /// 復号に失敗（認証タグ検証失敗を含む）
    #[error("decryption failed (authentication tag mismatch)")]
    DecryptionFailed,
    /// 暗号文が nonce + タグより短い
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
    /// nonce カウンタを使い切った
    #[error("nonce counter exhausted")]
    CounterExhausted,
    /// OS 乱数源の取得に失敗
    #[error("random source unavailable")]
    RandomUnavailable,
}
