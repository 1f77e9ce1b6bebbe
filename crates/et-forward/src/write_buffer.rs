//! ローカルソケットへの書き込みバッファ

use std::collections::VecDeque;
use std::io;

use et_transport::{is_retryable, Fd, SocketHandler};

/// 1 ソケットあたりに溜められる未送信バイト数の上限
pub const WRITE_BUFFER_LIMIT: usize = 256 * 1024;

/// ローカルソケット向けの送信待ちバイト列
///
/// ## 責任
/// - トンネル越しに届いたデータを、ローカル側が読める分だけ書き出す
/// - 書けなかった残りを次の `flush` まで保持する
///
/// ## 注意
/// 書き込みは非ブロッキング。`WouldBlock` で止まった分は次回に回る。
#[derive(Debug)]
pub struct WriteBuffer {
    /// まだソケットに渡していないデータ
    pending: VecDeque<u8>,
    limit: usize,
    /// 書き出した総バイト数（統計用）
    total_written: u64,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::with_limit(WRITE_BUFFER_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        WriteBuffer {
            pending: VecDeque::new(),
            limit,
            total_written: 0,
        }
    }

    /// 送信データを積む
    ///
    /// 上限を超える場合は何も積まずに `false` を返す。
    pub fn enqueue(&mut self, data: &[u8]) -> bool {
        if self.pending.len() + data.len() > self.limit {
            return false;
        }
        self.pending.extend(data.iter().copied());
        true
    }

    /// 先頭の連続領域を覗く
    pub fn peek(&self) -> &[u8] {
        self.pending.as_slices().0
    }

    /// 先頭から `n` バイトを送信済みとして捨てる
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.pending.len());
        self.pending.drain(..n);
        self.total_written += n as u64;
    }

    /// 書けるだけ書き出し、書いたバイト数を返す
    ///
    /// # エラー
    /// `WouldBlock` 以外のソケットエラー
    pub fn flush(&mut self, socket_handler: &dyn SocketHandler, fd: Fd) -> io::Result<usize> {
        let mut written = 0;
        while !self.pending.is_empty() {
            let result = socket_handler.write(fd, self.peek());
            match result {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.consume(n);
                    written += n;
                }
                Err(e) if is_retryable(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    pub fn can_accept_more(&self) -> bool {
        self.pending.len() < self.limit
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn total_written_bytes(&self) -> u64 {
        self.total_written
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use et_transport::InMemorySocketHandler;

    use super::*;

    #[test]
    fn test_enqueue_and_flush() {
        let handler = InMemorySocketHandler::new();
        let (a, b) = handler.create_pair();
        let mut buffer = WriteBuffer::new();
        assert!(buffer.enqueue(b"hello"));
        assert!(buffer.enqueue(b" world"));

        assert_eq!(buffer.flush(&handler, a).unwrap(), 11);
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_written_bytes(), 11);

        let mut out = [0u8; 11];
        handler.read_all(b, &mut out, None).unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn test_limit() {
        let mut buffer = WriteBuffer::with_limit(4);
        assert!(buffer.enqueue(b"abc"));
        assert!(buffer.can_accept_more());
        assert!(!buffer.enqueue(b"de"));
        assert_eq!(buffer.len(), 3);
        assert!(buffer.enqueue(b"d"));
        assert!(!buffer.can_accept_more());
    }

    #[test]
    fn test_consume_partial() {
        let mut buffer = WriteBuffer::new();
        buffer.enqueue(b"abcdef");
        buffer.consume(2);
        assert_eq!(buffer.peek(), b"cdef");
        buffer.consume(100);
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_written_bytes(), 6);
    }

    #[test]
    fn test_flush_to_closed_peer_fails() {
        let handler = InMemorySocketHandler::new();
        let (a, b) = handler.create_pair();
        handler.close(b);
        let mut buffer = WriteBuffer::new();
        buffer.enqueue(b"lost");
        let err = buffer.flush(&handler, a).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(buffer.len(), 4);
    }
}
