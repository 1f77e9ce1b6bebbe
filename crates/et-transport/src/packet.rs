//! データパケット構造
//!
//! ## Wire Format
//! ```text
//! シリアライズ:   [encrypted: u8][header: u8][payload...]
//! ソケット上:     [length: u32 BE][シリアライズ済みパケット]
//! 暗号化ペイロード: [counter: u64 BE][ciphertext + tag]
//! ```
//!
//! ヘッダは暗号化しない（AEAD の追加認証データとして保護する）。
//! シーケンス番号は暗号文先頭のカウンタ + 1 で、復号せずに読める。

use et_crypto::CryptoHandler;
use et_proto::PacketType;

use crate::error::{Result, TransportError};

/// フレーム長プレフィックスのバイト数
pub const FRAME_HEADER_LEN: usize = 4;

/// シリアライズ済みパケットの固定部分（encrypted + header）
const PACKET_PREFIX_LEN: usize = 2;

/// データパケット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    encrypted: bool,
    header: u8,
    payload: Vec<u8>,
}

impl Packet {
    /// 平文パケットを生成する
    pub fn new(header: u8, payload: impl Into<Vec<u8>>) -> Self {
        Packet {
            encrypted: false,
            header,
            payload: payload.into(),
        }
    }

    /// 種別付きの平文パケットを生成する
    pub fn typed(kind: PacketType, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(kind.into(), payload)
    }

    pub fn header(&self) -> u8 {
        self.header
    }

    /// ヘッダを既知の種別として解釈する
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::try_from(self.header).ok()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// 暗号化済みパケットのシーケンス番号（1 始まり）
    ///
    /// 平文パケット、またはカウンタを持たない短いペイロードでは `None`。
    pub fn sequence_number(&self) -> Option<i64> {
        if !self.encrypted {
            return None;
        }
        let counter = CryptoHandler::carried_counter(&self.payload)?;
        i64::try_from(counter).ok().map(|c| c + 1)
    }

    /// `[encrypted][header][payload]` にシリアライズする
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_PREFIX_LEN + self.payload.len());
        out.push(u8::from(self.encrypted));
        out.push(self.header);
        out.extend_from_slice(&self.payload);
        out
    }

    /// シリアライズ済みバイト列からパケットを復元する
    ///
    /// # エラー
    /// - `TransportError::TooShort`: 2 バイト未満
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_PREFIX_LEN {
            return Err(TransportError::TooShort(bytes.len()));
        }
        Ok(Packet {
            encrypted: bytes[0] != 0,
            header: bytes[1],
            payload: bytes[PACKET_PREFIX_LEN..].to_vec(),
        })
    }

    /// ソケットに書く長さ付きフレームを返す
    pub fn frame(serialized: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + serialized.len());
        out.extend_from_slice(&(serialized.len() as u32).to_be_bytes());
        out.extend_from_slice(serialized);
        out
    }

    /// ペイロードをその場で暗号化する
    pub fn encrypt(&mut self, crypto: &mut CryptoHandler) -> Result<()> {
        if self.encrypted {
            return Err(TransportError::AlreadyEncrypted);
        }
        self.payload = crypto.encrypt_with_associated_data(&self.payload, &[self.header])?;
        self.encrypted = true;
        Ok(())
    }

    /// ペイロードをその場で復号する
    pub fn decrypt(&mut self, crypto: &CryptoHandler) -> Result<()> {
        if !self.encrypted {
            return Err(TransportError::NotEncrypted);
        }
        self.payload = crypto.decrypt_with_associated_data(&self.payload, &[self.header])?;
        self.encrypted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use et_crypto::{CryptoError, Direction};

    use super::*;

    const KEY: &[u8] = b"12345678901234567890123456789012";

    #[test]
    fn test_serialize_layout() {
        let packet = Packet::new(42, "hi");
        assert_eq!(packet.serialize(), vec![0, 42, b'h', b'i']);
        assert_eq!(Packet::deserialize(&packet.serialize()).unwrap(), packet);
    }

    #[test]
    fn test_deserialize_too_short() {
        assert!(matches!(Packet::deserialize(&[1]), Err(TransportError::TooShort(1))));
    }

    #[test]
    fn test_frame_prefix() {
        let frame = Packet::frame(&[9, 9, 9]);
        assert_eq!(frame, vec![0, 0, 0, 3, 9, 9, 9]);
    }

    #[test]
    fn test_encrypt_then_decrypt_in_place() {
        let mut writer = CryptoHandler::new(KEY, Direction::ToServer).unwrap();
        let reader = CryptoHandler::new(KEY, Direction::ToServer).unwrap();

        let mut packet = Packet::new(7, "payload");
        packet.encrypt(&mut writer).unwrap();
        assert!(packet.is_encrypted());
        assert_eq!(packet.header(), 7);
        assert_eq!(packet.sequence_number(), Some(1));
        assert!(matches!(packet.encrypt(&mut writer), Err(TransportError::AlreadyEncrypted)));

        let mut wire = Packet::deserialize(&packet.serialize()).unwrap();
        wire.decrypt(&reader).unwrap();
        assert_eq!(wire.payload(), b"payload");
        assert_eq!(wire.sequence_number(), None);
    }

    #[test]
    fn test_header_tamper_detected() {
        let mut writer = CryptoHandler::new(KEY, Direction::ToServer).unwrap();
        let reader = CryptoHandler::new(KEY, Direction::ToServer).unwrap();

        let mut packet = Packet::new(3, "data");
        packet.encrypt(&mut writer).unwrap();
        let mut bytes = packet.serialize();
        bytes[1] = 4;

        let mut tampered = Packet::deserialize(&bytes).unwrap();
        assert!(matches!(
            tampered.decrypt(&reader),
            Err(TransportError::Crypto(CryptoError::DecryptionFailed))
        ));
    }

    #[test]
    fn test_typed_packet() {
        let packet = Packet::typed(PacketType::Heartbeat, Vec::new());
        assert_eq!(packet.packet_type(), Some(PacketType::Heartbeat));
        assert_eq!(Packet::new(200, "").packet_type(), None);
    }
}
