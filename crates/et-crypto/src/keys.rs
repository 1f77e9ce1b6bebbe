//! パスキー / クライアント ID 生成
//!
//! セッション鍵は毎回 OS 乱数から新しく作る（使い回さない）。

use crate::error::CryptoError;
use crate::handler::KEY_LEN;

const ALPHANUMERIC: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// クライアント ID の長さ
pub const CLIENT_ID_LEN: usize = 16;

/// 32 文字の英数字パスキーを生成する（そのまま AES-256 鍵になる）
pub fn generate_passkey() -> Result<String, CryptoError> {
    random_alphanumeric(KEY_LEN)
}

/// 16 文字の英数字クライアント ID を生成する
pub fn generate_client_id() -> Result<String, CryptoError> {
    random_alphanumeric(CLIENT_ID_LEN)
}

/// 偏りのない英数字列を生成する
///
/// 62 の倍数未満のバイトだけを採用する（棄却サンプリング）。
pub fn random_alphanumeric(len: usize) -> Result<String, CryptoError> {
    let limit = (256 / ALPHANUMERIC.len() * ALPHANUMERIC.len()) as u8;
    let mut out = String::with_capacity(len);
    let mut pool = [0u8; 64];

    while out.len() < len {
        getrandom::getrandom(&mut pool).map_err(|_| CryptoError::RandomUnavailable)?;
        for &b in pool.iter().filter(|&&b| b < limit) {
            if out.len() == len {
                break;
            }
            out.push(ALPHANUMERIC[b as usize % ALPHANUMERIC.len()] as char);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passkey_shape() {
        let key = generate_passkey().unwrap();
        assert_eq!(key.len(), KEY_LEN);
        assert!(key.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_client_ids_differ() {
        let a = generate_client_id().unwrap();
        let b = generate_client_id().unwrap();
        assert_eq!(a.len(), CLIENT_ID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_zero_length() {
        assert_eq!(random_alphanumeric(0).unwrap(), "");
    }
}
