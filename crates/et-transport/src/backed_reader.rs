//! 順序検査付きの受信側
//!
//! ```text
//! ソケット / ローカルバッファ
//!   → [length: u32 BE][serialized packet]
//!   → 復号（認証失敗は致命的）
//!   → シーケンス番号検査（重複は破棄、欠落は致命的）
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use et_crypto::CryptoHandler;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::packet::{Packet, FRAME_HEADER_LEN};
use crate::socket::{is_retryable, Fd, SocketHandler};

/// 既定のフレーム長上限
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// 順序検査付きの受信側
pub struct BackedReader {
    socket_handler: Arc<dyn SocketHandler>,
    crypto: CryptoHandler,
    socket_fd: Option<Fd>,
    /// 最後に配送したシーケンス番号
    sequence_number: i64,
    /// 再接続時に相手から受け取ったシリアライズ済みパケット
    local_buffer: VecDeque<Vec<u8>>,
    /// 読みかけのフレーム（長さプレフィックス込み）
    partial_frame: Vec<u8>,
    max_frame_bytes: usize,
}

impl BackedReader {
    pub fn new(socket_handler: Arc<dyn SocketHandler>, crypto: CryptoHandler, socket_fd: Option<Fd>) -> Self {
        BackedReader {
            socket_handler,
            crypto,
            socket_fd,
            sequence_number: 0,
            local_buffer: VecDeque::new(),
            partial_frame: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// 読み出せるものがあるか
    pub fn has_data(&self) -> bool {
        if !self.local_buffer.is_empty() {
            return true;
        }
        match self.socket_fd {
            Some(fd) => self.socket_handler.has_data(fd),
            None => false,
        }
    }

    /// パケットを最大 1 つ読む
    ///
    /// 読めるバイトがなければ `Ok(None)`。重複パケットは黙って捨てて
    /// `Ok(None)` を返す。
    ///
    /// # エラー
    /// - `TransportError::Io`: EOF（`BrokenPipe`）またはソケットエラー
    /// - `TransportError::Crypto`: 認証失敗
    /// - `TransportError::SequenceGap`: 欠落
    pub fn read(&mut self) -> Result<Option<Packet>> {
        while let Some(serialized) = self.local_buffer.pop_front() {
            if let Some(packet) = self.accept(&serialized)? {
                return Ok(Some(packet));
            }
        }

        let Some(fd) = self.socket_fd else {
            return Ok(None);
        };

        if self.partial_frame.len() < FRAME_HEADER_LEN {
            let missing = FRAME_HEADER_LEN - self.partial_frame.len();
            if !self.fill(fd, missing)? || self.partial_frame.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
        }

        let mut len_buf = [0u8; FRAME_HEADER_LEN];
        len_buf.copy_from_slice(&self.partial_frame[..FRAME_HEADER_LEN]);
        let length = u32::from_be_bytes(len_buf) as usize;
        if length > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                length,
                limit: self.max_frame_bytes,
            });
        }

        let total = FRAME_HEADER_LEN + length;
        if self.partial_frame.len() < total {
            let missing = total - self.partial_frame.len();
            if !self.fill(fd, missing)? || self.partial_frame.len() < total {
                return Ok(None);
            }
        }

        let frame = std::mem::take(&mut self.partial_frame);
        self.accept(&frame[FRAME_HEADER_LEN..])
    }

    /// 最大 `missing` バイトを読み足す。データがなければ `false`。
    fn fill(&mut self, fd: Fd, missing: usize) -> Result<bool> {
        let start = self.partial_frame.len();
        self.partial_frame.resize(start + missing, 0);
        let result = self.socket_handler.read(fd, &mut self.partial_frame[start..]);
        match result {
            Ok(0) => {
                self.partial_frame.truncate(start);
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed the connection").into())
            }
            Ok(n) => {
                self.partial_frame.truncate(start + n);
                Ok(true)
            }
            Err(e) if is_retryable(&e) => {
                self.partial_frame.truncate(start);
                Ok(false)
            }
            Err(e) => {
                self.partial_frame.truncate(start);
                Err(e.into())
            }
        }
    }

    /// 復号と番号検査。重複なら `None`。
    ///
    /// 番号は暗号文に載っているので、認証が通ってから比べる。
    fn accept(&mut self, serialized: &[u8]) -> Result<Option<Packet>> {
        let mut packet = Packet::deserialize(serialized)?;
        let sequence = packet
            .sequence_number()
            .ok_or(TransportError::TooShort(serialized.len()))?;
        packet.decrypt(&self.crypto)?;

        let expected = self.sequence_number + 1;
        if sequence < expected {
            debug!(sequence, last = self.sequence_number, "dropping duplicate packet");
            return Ok(None);
        }
        if sequence > expected {
            return Err(TransportError::SequenceGap {
                expected,
                actual: sequence,
            });
        }

        self.sequence_number = sequence;
        trace!(sequence, header = packet.header(), "delivered packet");
        Ok(Some(packet))
    }

    /// 新しいソケットに付け替え、相手の再送分を先に読むよう積む
    pub fn revive(&mut self, socket_fd: Fd, cached: Vec<Vec<u8>>) {
        self.partial_frame.clear();
        self.local_buffer.extend(cached);
        self.socket_fd = Some(socket_fd);
    }

    pub fn invalidate_socket(&mut self) {
        self.socket_fd = None;
    }

    pub fn socket_fd(&self) -> Option<Fd> {
        self.socket_fd
    }

    /// 最後に配送したシーケンス番号
    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }
}

#[cfg(test)]
mod tests {
    use et_crypto::{CryptoError, Direction};

    use super::*;
    use crate::memory::InMemorySocketHandler;

    const KEY: &[u8] = b"12345678901234567890123456789012";

    fn encrypt_all(payloads: &[&str]) -> Vec<Vec<u8>> {
        let mut crypto = CryptoHandler::new(KEY, Direction::ToClient).unwrap();
        payloads
            .iter()
            .map(|payload| {
                let mut packet = Packet::new(1, *payload);
                packet.encrypt(&mut crypto).unwrap();
                packet.serialize()
            })
            .collect()
    }

    fn reader_on(handler: &Arc<InMemorySocketHandler>, fd: Option<Fd>) -> BackedReader {
        let crypto = CryptoHandler::new(KEY, Direction::ToClient).unwrap();
        BackedReader::new(handler.clone(), crypto, fd)
    }

    #[test]
    fn test_no_data_returns_none() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let (a, _b) = handler.create_pair();
        let mut reader = reader_on(&handler, Some(a));
        assert!(!reader.has_data());
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_across_calls() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let (a, b) = handler.create_pair();
        let mut reader = reader_on(&handler, Some(a));

        let frame = Packet::frame(&encrypt_all(&["split"])[0]);
        handler.write(b, &frame[..2]).unwrap();
        assert!(reader.read().unwrap().is_none());
        handler.write(b, &frame[2..7]).unwrap();
        assert!(reader.read().unwrap().is_none());
        handler.write(b, &frame[7..]).unwrap();

        let packet = reader.read().unwrap().unwrap();
        assert_eq!(packet.payload(), b"split");
        assert_eq!(reader.sequence_number(), 1);
    }

    #[test]
    fn test_duplicates_dropped() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let fd = handler.create_loopback();
        let mut reader = reader_on(&handler, None);
        let packets = encrypt_all(&["one", "two"]);

        reader.revive(fd, vec![packets[0].clone(), packets[0].clone(), packets[1].clone()]);
        assert_eq!(reader.read().unwrap().unwrap().payload(), b"one");
        assert_eq!(reader.read().unwrap().unwrap().payload(), b"two");
        assert_eq!(reader.sequence_number(), 2);

        handler.write(fd, &Packet::frame(&packets[1])).unwrap();
        assert!(reader.read().unwrap().is_none());
        assert_eq!(reader.sequence_number(), 2);
    }

    #[test]
    fn test_gap_is_fatal() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let mut reader = reader_on(&handler, None);
        let packets = encrypt_all(&["one", "two"]);

        reader.revive(handler.create_loopback(), vec![packets[1].clone()]);
        assert!(matches!(
            reader.read(),
            Err(TransportError::SequenceGap { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn test_auth_failure_is_fatal() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let mut reader = reader_on(&handler, None);
        let mut packet = encrypt_all(&["secret"]).remove(0);
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;

        reader.revive(handler.create_loopback(), vec![packet]);
        let err = reader.read().unwrap_err();
        assert!(matches!(err, TransportError::Crypto(CryptoError::DecryptionFailed)));
        assert!(err.is_fatal());
        assert_eq!(reader.sequence_number(), 0);
    }

    #[test]
    fn test_forged_old_counter_fails_authentication() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let mut reader = reader_on(&handler, None);
        let packets = encrypt_all(&["one", "two"]);

        // 2 番目のパケットのカウンタを 0 に書き換えて重複に見せかける
        let mut forged = packets[1].clone();
        forged[2..10].copy_from_slice(&0u64.to_be_bytes());
        assert_eq!(Packet::deserialize(&forged).unwrap().sequence_number(), Some(1));

        reader.revive(handler.create_loopback(), vec![packets[0].clone(), forged]);
        assert_eq!(reader.read().unwrap().unwrap().payload(), b"one");
        assert!(matches!(
            reader.read(),
            Err(TransportError::Crypto(CryptoError::DecryptionFailed))
        ));
        assert_eq!(reader.sequence_number(), 1);
    }

    #[test]
    fn test_eof_is_broken_pipe() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let (a, b) = handler.create_pair();
        let mut reader = reader_on(&handler, Some(a));
        handler.close(b);

        assert!(reader.has_data());
        match reader.read() {
            Err(TransportError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected broken pipe, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let fd = handler.create_loopback();
        let mut reader = reader_on(&handler, Some(fd)).with_max_frame_bytes(8);
        handler.write(fd, &100u32.to_be_bytes()).unwrap();
        assert!(matches!(
            reader.read(),
            Err(TransportError::FrameTooLarge { length: 100, limit: 8 })
        ));
    }
}
