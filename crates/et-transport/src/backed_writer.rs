//! 再送可能な送信側
//!
//! 書いたパケットは暗号化してバックログに残す。再接続ハンドシェイクで
//! 相手が受信済みと申告した番号まで破棄し、それより後を再送する。

use std::collections::VecDeque;
use std::sync::Arc;

use et_crypto::CryptoHandler;
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportError};
use crate::packet::Packet;
use crate::socket::{Fd, SocketHandler};

/// バックログが保持する暗号化済みバイト数の既定上限
pub const DEFAULT_MAX_BACKLOG_BYTES: usize = 64 * 1024 * 1024;

/// `BackedWriter::write` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 送信まで完了
    Success,
    /// バックログには積んだがソケットへの書き込みに失敗した（再接続後に再送される）
    Failure,
    /// ソケットがないため受け付けなかった（何も消費していない）
    Skipped,
}

#[derive(Debug, Clone)]
struct BacklogEntry {
    sequence_number: i64,
    serialized: Vec<u8>,
}

/// 再送可能な送信側
pub struct BackedWriter {
    socket_handler: Arc<dyn SocketHandler>,
    crypto: CryptoHandler,
    socket_fd: Option<Fd>,
    /// 最後に割り当てたシーケンス番号
    sequence_number: i64,
    /// 未破棄のパケット（シーケンス番号順、連続）
    backlog: VecDeque<BacklogEntry>,
    backlog_bytes: usize,
    /// これを超えたら古いものから捨てる
    max_backlog_bytes: usize,
}

impl BackedWriter {
    pub fn new(socket_handler: Arc<dyn SocketHandler>, crypto: CryptoHandler, socket_fd: Option<Fd>) -> Self {
        BackedWriter {
            socket_handler,
            crypto,
            socket_fd,
            sequence_number: 0,
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            max_backlog_bytes: DEFAULT_MAX_BACKLOG_BYTES,
        }
    }

    pub fn with_max_backlog_bytes(mut self, max_backlog_bytes: usize) -> Self {
        self.max_backlog_bytes = max_backlog_bytes;
        self
    }

    /// パケットを暗号化・記録して送信する
    ///
    /// # エラー
    /// 暗号化に失敗した場合のみ。ソケットエラーは `WriteOutcome::Failure`。
    pub fn write(&mut self, packet: &Packet) -> Result<WriteOutcome> {
        let Some(fd) = self.socket_fd else {
            return Ok(WriteOutcome::Skipped);
        };

        let mut packet = packet.clone();
        packet.encrypt(&mut self.crypto)?;
        self.sequence_number += 1;
        let serialized = packet.serialize();
        let frame = Packet::frame(&serialized);

        self.backlog_bytes += serialized.len();
        self.backlog.push_back(BacklogEntry {
            sequence_number: self.sequence_number,
            serialized,
        });
        self.enforce_backlog_limit();

        match self.socket_handler.write_all_or_return(fd, &frame) {
            Ok(n) if n == frame.len() => Ok(WriteOutcome::Success),
            Ok(n) => {
                warn!(fd, written = n, expected = frame.len(), "partial frame write");
                Ok(WriteOutcome::Failure)
            }
            Err(e) => {
                debug!(fd, sequence = self.sequence_number, error = %e, "write failed, packet kept in backlog");
                Ok(WriteOutcome::Failure)
            }
        }
    }

    /// `after` より後のバックログを順に返し、`after` 以前を破棄する
    ///
    /// ソケットが無効化されている必要がある。
    ///
    /// # エラー
    /// - `TransportError::SocketStillAlive`: ソケットがまだ有効
    /// - `TransportError::PeerAhead`: 相手が未送信の番号を受信済みと主張した
    /// - `TransportError::BacklogExhausted`: 必要な範囲が既に破棄済み
    pub fn recover(&mut self, after: i64) -> Result<Vec<Vec<u8>>> {
        if self.socket_fd.is_some() {
            return Err(TransportError::SocketStillAlive);
        }
        if after > self.sequence_number {
            return Err(TransportError::PeerAhead {
                peer: after,
                local: self.sequence_number,
            });
        }
        if let Some(oldest) = self.backlog.front().map(|entry| entry.sequence_number) {
            if after + 1 < oldest {
                return Err(TransportError::BacklogExhausted { requested: after + 1, oldest });
            }
        } else if after < self.sequence_number {
            return Err(TransportError::BacklogExhausted {
                requested: after + 1,
                oldest: self.sequence_number + 1,
            });
        }

        self.retire_through(after);
        Ok(self.backlog.iter().map(|entry| entry.serialized.clone()).collect())
    }

    /// `sequence_number` 以前のバックログを破棄する
    pub fn retire_through(&mut self, sequence_number: i64) {
        while let Some(entry) = self.backlog.front() {
            if entry.sequence_number > sequence_number {
                break;
            }
            self.backlog_bytes -= entry.serialized.len();
            self.backlog.pop_front();
        }
    }

    fn enforce_backlog_limit(&mut self) {
        let mut dropped = 0usize;
        while self.backlog_bytes > self.max_backlog_bytes {
            let Some(entry) = self.backlog.pop_front() else {
                break;
            };
            self.backlog_bytes -= entry.serialized.len();
            dropped += 1;
        }
        if dropped > 0 {
            trace!(dropped, backlog_bytes = self.backlog_bytes, "backlog trimmed to limit");
        }
    }

    /// 新しいソケットに付け替える（番号とバックログは維持）
    pub fn revive(&mut self, socket_fd: Fd) {
        self.socket_fd = Some(socket_fd);
    }

    pub fn invalidate_socket(&mut self) {
        self.socket_fd = None;
    }

    pub fn socket_fd(&self) -> Option<Fd> {
        self.socket_fd
    }

    /// 最後に割り当てたシーケンス番号
    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn backlog_bytes(&self) -> usize {
        self.backlog_bytes
    }
}
