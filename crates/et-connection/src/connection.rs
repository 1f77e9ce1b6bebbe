//! 再接続可能なコネクション
//!
//! 1 本のソケットに `BackedReader` / `BackedWriter` の組を束ね、
//! 切断を検出したら再接続戦略に従って新しいソケットへ付け替える。
//!
//! ## 状態遷移
//!
//! ```text
//! Connected ──(ソケットエラー)──▶ Disconnected ──(再接続)──▶ Recovering ──▶ Connected
//!                                                              │
//!                                          (致命的エラー / 破棄)└──▶ Closed
//! ```
//!
//! ## 再接続ハンドシェイク（双方が対称に実行）
//!
//! ```text
//! 1. SequenceHeader{自分が受信済みの最後の番号} を送る
//! 2. 相手の SequenceHeader を受け取る
//! 3. BackedWriter.recover(相手の番号) を CatchupBuffer として送る
//! 4. 相手の CatchupBuffer を受け取り BackedReader.revive に渡す
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use et_crypto::{CryptoHandler, Direction};
use et_proto::{CatchupBuffer, PacketType, SequenceHeader};
use et_transport::{
    BackedReader, BackedWriter, Fd, Packet, SocketHandler, SocketHandlerExt, WriteOutcome,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, Result};

/// 接続のどちら側か（送受信の nonce 方向を決める）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn outgoing(self) -> Direction {
        match self {
            Role::Client => Direction::ToServer,
            Role::Server => Direction::ToClient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Recovering,
    /// 終端状態（shutdown 済み）
    Closed,
}

/// 再接続戦略の試行結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedialOutcome {
    /// 受け入れ済みのソケット。続けて再接続ハンドシェイクを行う。
    Ready(Fd),
    RetryLater,
    /// 相手側でセッションが破棄されている
    SessionTerminated,
}

/// 切断時にどう再接続するか
pub trait ReconnectStrategy: Send {
    fn redial(
        &mut self,
        socket_handler: &Arc<dyn SocketHandler>,
        client_id: &str,
        config: &ConnectionConfig,
    ) -> RedialOutcome;
}

/// 自分からは再接続しない（サーバー側: クライアントが戻ってくるのを待つ）
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitForPeer;

impl ReconnectStrategy for WaitForPeer {
    fn redial(&mut self, _: &Arc<dyn SocketHandler>, _: &str, _: &ConnectionConfig) -> RedialOutcome {
        RedialOutcome::RetryLater
    }
}

/// 接続の統計情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub reader_sequence: i64,
    pub writer_sequence: i64,
    pub backlog_len: usize,
    pub backlog_bytes: usize,
    pub reconnects: u64,
}

impl ConnectionStats {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub(crate) fn write_timed_out() -> ConnectionError {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "connection did not accept packet in time").into()
}

/// 再接続可能なコネクション
pub struct Connection {
    socket_handler: Arc<dyn SocketHandler>,
    id: String,
    key: String,
    reader: BackedReader,
    writer: BackedWriter,
    socket_fd: Option<Fd>,
    state: ConnectionState,
    shutting_down: bool,
    strategy: Box<dyn ReconnectStrategy>,
    config: ConnectionConfig,
    last_redial: Option<Instant>,
    last_send: Instant,
    last_recv: Instant,
    reconnects: u64,
}

impl Connection {
    /// ソケット未接続のコネクションを作る
    ///
    /// # エラー
    /// - `ConnectionError::Crypto`: 鍵が 32 バイトでない
    pub fn new(
        socket_handler: Arc<dyn SocketHandler>,
        id: impl Into<String>,
        key: impl Into<String>,
        role: Role,
        strategy: Box<dyn ReconnectStrategy>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let key = key.into();
        let writer_crypto = CryptoHandler::new(key.as_bytes(), role.outgoing())?;
        let reader_crypto = CryptoHandler::new(key.as_bytes(), role.outgoing().reverse())?;
        let now = Instant::now();

        Ok(Connection {
            reader: BackedReader::new(socket_handler.clone(), reader_crypto, None)
                .with_max_frame_bytes(config.max_frame_bytes),
            writer: BackedWriter::new(socket_handler.clone(), writer_crypto, None)
                .with_max_backlog_bytes(config.max_backlog_bytes),
            socket_handler,
            id: id.into(),
            key,
            socket_fd: None,
            state: ConnectionState::Disconnected,
            shutting_down: false,
            strategy,
            config,
            last_redial: None,
            last_send: now,
            last_recv: now,
            reconnects: 0,
        })
    }

    /// 初回接続のソケットを結びつける（ハンドシェイクなし）
    pub(crate) fn attach(&mut self, fd: Fd) {
        if let Some(old) = self.socket_fd.take() {
            self.socket_handler.close(old);
        }
        self.reader.revive(fd, Vec::new());
        self.writer.revive(fd);
        self.socket_fd = Some(fd);
        self.state = ConnectionState::Connected;
        self.touch();
    }

    fn touch(&mut self) {
        let now = Instant::now();
        self.last_send = now;
        self.last_recv = now;
    }

    /// パケットを最大 1 つ読む
    ///
    /// 切断中や読めるデータがないときは `Ok(None)`。ハートビートは
    /// 呼び出し側に渡さない。
    ///
    /// # エラー
    /// - `ConnectionError::ShuttingDown`: shutdown 済み
    /// - `ConnectionError::Transport`: 認証失敗などの致命的エラー（接続は閉じられる）
    pub fn read(&mut self) -> Result<Option<Packet>> {
        if self.shutting_down {
            return Err(ConnectionError::ShuttingDown);
        }
        if self.state != ConnectionState::Connected {
            return Ok(None);
        }
        loop {
            match self.reader.read() {
                Ok(Some(packet)) => {
                    self.last_recv = Instant::now();
                    if packet.packet_type() == Some(PacketType::Heartbeat) {
                        continue;
                    }
                    return Ok(Some(packet));
                }
                Ok(None) => return Ok(None),
                Err(e) if !e.is_fatal() => {
                    info!(id = %self.id, error = %e, "socket lost while reading");
                    self.close_socket_and_maybe_reconnect();
                    return Ok(None);
                }
                Err(e) => {
                    error!(id = %self.id, error = %e, "fatal error on connection");
                    self.shutdown();
                    return Err(e.into());
                }
            }
        }
    }

    /// パケットを書く
    ///
    /// 切断中は `false`（パケットは受け付けられていない）。ソケットへの
    /// 書き込みに失敗した場合はバックログに残るため `true`。
    pub fn write(&mut self, packet: &Packet) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        match self.writer.write(packet) {
            Ok(WriteOutcome::Success) => {
                self.last_send = Instant::now();
                true
            }
            Ok(WriteOutcome::Failure) => {
                self.close_socket_and_maybe_reconnect();
                true
            }
            Ok(WriteOutcome::Skipped) => false,
            Err(e) => {
                error!(id = %self.id, error = %e, "could not encrypt packet");
                false
            }
        }
    }

    /// 受け付けられるまで書き込みを繰り返す
    ///
    /// 切断中は再接続を試みながら待つ。`SharedClientConnection` 越しに書く場合は
    /// ロックを握ったまま待たないよう `write_shared_packet` を使う。
    pub fn write_packet(&mut self, packet: &Packet, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(pause) = self.try_write_packet(packet)? else {
                return Ok(());
            };
            if Instant::now() >= deadline {
                return Err(write_timed_out());
            }
            thread::sleep(pause);
        }
    }

    /// `write_packet` の 1 回分。受け付けられたら `None`、それ以外は次の試行までの間隔。
    pub(crate) fn try_write_packet(&mut self, packet: &Packet) -> Result<Option<Duration>> {
        if self.shutting_down {
            return Err(ConnectionError::ShuttingDown);
        }
        if self.write(packet) {
            return Ok(None);
        }
        let pause = if self.poll_reconnect() {
            self.config.write_retry_interval()
        } else {
            self.config.disconnected_retry_interval()
        };
        Ok(Some(pause))
    }

    pub fn has_data(&self) -> bool {
        self.state == ConnectionState::Connected && self.reader.has_data()
    }

    /// ソケットを閉じて切断状態にする
    pub fn close_socket(&mut self) {
        if let Some(fd) = self.socket_fd.take() {
            info!(id = %self.id, fd, "closing socket");
            self.reader.invalidate_socket();
            self.writer.invalidate_socket();
            self.socket_handler.close(fd);
        }
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// ソケットを閉じ、戦略に従ってすぐ再接続を試みる
    pub fn close_socket_and_maybe_reconnect(&mut self) {
        self.close_socket();
        self.last_redial = None;
        self.poll_reconnect();
    }

    /// 切断中なら（間隔を空けて）再接続を試みる。接続中なら `true`。
    pub fn poll_reconnect(&mut self) -> bool {
        match self.state {
            ConnectionState::Connected => return true,
            ConnectionState::Closed => return false,
            ConnectionState::Disconnected | ConnectionState::Recovering => {}
        }
        if self.shutting_down {
            return false;
        }
        if let Some(last) = self.last_redial {
            if last.elapsed() < self.config.reconnect_interval() {
                return false;
            }
        }
        self.last_redial = Some(Instant::now());

        match self.strategy.redial(&self.socket_handler, &self.id, &self.config) {
            RedialOutcome::Ready(fd) => self.recover(fd),
            RedialOutcome::RetryLater => false,
            RedialOutcome::SessionTerminated => {
                warn!(id = %self.id, "peer terminated the session");
                self.shutdown();
                false
            }
        }
    }

    /// 新しいソケットで再接続ハンドシェイクを行う
    pub fn recover(&mut self, new_fd: Fd) -> bool {
        match self.try_recover(new_fd) {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %self.id, fd = new_fd, error = %e, "recovery failed");
                false
            }
        }
    }

    /// `recover` のエラーを返す版
    pub fn try_recover(&mut self, new_fd: Fd) -> Result<()> {
        if self.shutting_down {
            self.socket_handler.close(new_fd);
            return Err(ConnectionError::ShuttingDown);
        }
        self.close_socket();
        self.state = ConnectionState::Recovering;

        match self.exchange_catchup(new_fd) {
            Ok(()) => {
                self.socket_fd = Some(new_fd);
                self.state = ConnectionState::Connected;
                self.reconnects += 1;
                self.touch();
                info!(
                    id = %self.id,
                    fd = new_fd,
                    reader_sequence = self.reader.sequence_number(),
                    writer_sequence = self.writer.sequence_number(),
                    "connection recovered"
                );
                Ok(())
            }
            Err(e) => {
                self.socket_handler.close(new_fd);
                self.reader.invalidate_socket();
                self.writer.invalidate_socket();
                if matches!(&e, ConnectionError::Transport(t) if t.is_fatal()) {
                    self.shutdown();
                } else {
                    self.state = ConnectionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    fn exchange_catchup(&mut self, fd: Fd) -> Result<()> {
        let timeout = Some(self.config.handshake_timeout());
        let local = SequenceHeader {
            sequence_number: self.reader.sequence_number(),
        };
        self.socket_handler.write_proto(fd, &local, timeout)?;
        let remote: SequenceHeader = self.socket_handler.read_proto(fd, timeout)?;
        debug!(
            id = %self.id,
            local = local.sequence_number,
            remote = remote.sequence_number,
            "sequence headers exchanged"
        );

        let catchup = CatchupBuffer {
            buffer: self.writer.recover(remote.sequence_number)?,
        };
        self.socket_handler.write_proto(fd, &catchup, timeout)?;
        let remote_catchup: CatchupBuffer = self.socket_handler.read_proto(fd, timeout)?;
        debug!(
            id = %self.id,
            sent = catchup.buffer.len(),
            received = remote_catchup.buffer.len(),
            "catchup buffers exchanged"
        );

        self.reader.revive(fd, remote_catchup.buffer);
        self.writer.revive(fd);
        Ok(())
    }

    /// 時間経過の処理: ハートビート送信・無通信検出・再接続
    pub fn tick(&mut self, now: Instant) {
        if self.state != ConnectionState::Connected {
            self.poll_reconnect();
            return;
        }
        if now.saturating_duration_since(self.last_recv) >= self.config.keepalive_timeout() {
            warn!(id = %self.id, "no data from peer, assuming the socket is dead");
            self.close_socket_and_maybe_reconnect();
            return;
        }
        if now.saturating_duration_since(self.last_send) >= self.config.heartbeat_interval() {
            self.write(&Packet::typed(PacketType::Heartbeat, Vec::new()));
        }
    }

    /// 接続を終了する（以降の read/write は即座に失敗する）
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        debug!(id = %self.id, "shutting down connection");
        self.shutting_down = true;
        self.close_socket();
        self.state = ConnectionState::Closed;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn socket_handler(&self) -> &Arc<dyn SocketHandler> {
        &self.socket_handler
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn socket_fd(&self) -> Option<Fd> {
        self.socket_fd
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// 最後に受信したシーケンス番号
    pub fn reader_sequence_number(&self) -> i64 {
        self.reader.sequence_number()
    }

    /// 最後に送信したシーケンス番号
    pub fn writer_sequence_number(&self) -> i64 {
        self.writer.sequence_number()
    }

    pub fn backlog_len(&self) -> usize {
        self.writer.backlog_len()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state,
            reader_sequence: self.reader.sequence_number(),
            writer_sequence: self.writer.sequence_number(),
            backlog_len: self.writer.backlog_len(),
            backlog_bytes: self.writer.backlog_bytes(),
            reconnects: self.reconnects,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.shutting_down {
            debug!(id = %self.id, "connection dropped without shutdown");
        }
        self.close_socket();
    }
}
