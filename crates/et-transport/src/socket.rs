//! ソケット抽象
//!
//! 上位レイヤーは整数ハンドル（`Fd`）越しにだけソケットを扱う。
//! 実装は TCP（`TcpSocketHandler`）とテスト用のメモリ内（`InMemorySocketHandler`）。
//!
//! すべてのメソッドは `&self` を取り、実装は内部でロックする。
//! `read`/`write` は非ブロッキングで、データがなければ `WouldBlock` を返す。

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use base64::Engine as _;
use prost::Message;

/// ソケットハンドル
pub type Fd = i32;

/// 完全読み書きヘルパーの既定タイムアウト
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// 制御メッセージの最大長
pub const MAX_MESSAGE_LEN: usize = 128 * 1024 * 1024;

/// 無期限待ちで 1 回の待機に使う上限
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// 接続先 / 待ち受けアドレス
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketEndpoint {
    pub host: String,
    pub port: u16,
}

impl SocketEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        SocketEndpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// ソケット操作の抽象
pub trait SocketHandler: Send + Sync {
    /// 読み出しがブロックしないか（データ・EOF・エラーのいずれかがある）
    fn has_data(&self, fd: Fd) -> bool;

    /// 非ブロッキング読み出し。`Ok(0)` は EOF。
    fn read(&self, fd: Fd, buf: &mut [u8]) -> io::Result<usize>;

    /// 非ブロッキング書き込み
    fn write(&self, fd: Fd, buf: &[u8]) -> io::Result<usize>;

    /// 接続して新しいハンドルを返す
    fn connect(&self, endpoint: &SocketEndpoint) -> io::Result<Fd>;

    /// 待ち受けを開始し、リスナーのハンドルを返す
    fn listen(&self, endpoint: &SocketEndpoint) -> io::Result<Vec<Fd>>;

    /// エンドポイントに紐づくリスナーのハンドル
    fn endpoint_fds(&self, endpoint: &SocketEndpoint) -> Vec<Fd>;

    /// 待機中の接続を 1 つ受け付ける（なければ `None`）
    fn accept(&self, listen_fd: Fd) -> io::Result<Option<Fd>>;

    fn stop_listening(&self, endpoint: &SocketEndpoint);

    fn close(&self, fd: Fd);

    /// 開いている接続ハンドル（リスナーを除く）
    fn active_sockets(&self) -> Vec<Fd>;

    /// 読み出しがブロックしなくなるまで最大 `timeout` 待つ
    ///
    /// 実装はスレッドを眠らせて待つこと（`has_data` を回し続けない）。
    fn wait_on_socket_data(&self, fd: Fd, timeout: Duration) -> bool;

    /// 書き込みがブロックしなくなるまで最大 `timeout` 待つ
    fn wait_writable(&self, fd: Fd, timeout: Duration) -> bool;

    /// `buf` を埋めるまで読む
    ///
    /// `timeout` は進捗があるたびにリセットされる。`None` なら無期限。
    fn read_all(&self, fd: Fd, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<()> {
        let mut filled = 0;
        let mut last_progress = Instant::now();
        while filled < buf.len() {
            let wait = match timeout {
                Some(limit) => {
                    let elapsed = last_progress.elapsed();
                    if elapsed >= limit {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out reading from socket"));
                    }
                    limit - elapsed
                }
                None => IDLE_WAIT,
            };
            if !self.wait_on_socket_data(fd, wait) {
                continue;
            }
            match self.read(fd, &mut buf[filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "socket closed during read"));
                }
                Ok(n) => {
                    filled += n;
                    last_progress = Instant::now();
                }
                Err(e) if is_retryable(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 書けるだけ書き、書いたバイト数を返す
    ///
    /// 既定タイムアウト内に詰まった場合は途中までのバイト数を返す。
    fn write_all_or_return(&self, fd: Fd, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut last_progress = Instant::now();
        while written < buf.len() {
            match self.write(fd, &buf[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    written += n;
                    last_progress = Instant::now();
                }
                Err(e) if is_retryable(&e) => {
                    let elapsed = last_progress.elapsed();
                    if elapsed >= DEFAULT_IO_TIMEOUT {
                        return Ok(written);
                    }
                    self.wait_writable(fd, DEFAULT_IO_TIMEOUT - elapsed);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// `buf` をすべて書く
    fn write_all(&self, fd: Fd, buf: &[u8], timeout: Option<Duration>) -> io::Result<()> {
        let mut written = 0;
        let mut last_progress = Instant::now();
        while written < buf.len() {
            match self.write(fd, &buf[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    written += n;
                    last_progress = Instant::now();
                }
                Err(e) if is_retryable(&e) => {
                    let wait = match timeout {
                        Some(limit) => {
                            let elapsed = last_progress.elapsed();
                            if elapsed >= limit {
                                return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out writing to socket"));
                            }
                            limit - elapsed
                        }
                        None => IDLE_WAIT,
                    };
                    self.wait_writable(fd, wait);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// `[length: u32 BE][bytes]` を書く
    fn write_message(&self, fd: Fd, bytes: &[u8], timeout: Option<Duration>) -> io::Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(bytes);
        self.write_all(fd, &frame, timeout)
    }

    /// `write_message` で書かれたメッセージを 1 つ読む
    fn read_message(&self, fd: Fd, timeout: Option<Duration>) -> io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.read_all(fd, &mut len_buf, timeout)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message length {len} exceeds limit"),
            ));
        }
        let mut body = vec![0u8; len];
        self.read_all(fd, &mut body, timeout)?;
        Ok(body)
    }

    /// base64 エンコードして書く
    fn write_b64(&self, fd: Fd, buf: &[u8]) -> io::Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(buf);
        self.write_all(fd, encoded.as_bytes(), Some(DEFAULT_IO_TIMEOUT))
    }

    /// `len` バイト分の base64 文字列を読んでデコードする
    fn read_b64(&self, fd: Fd, len: usize) -> io::Result<Vec<u8>> {
        let encoded_len = base64::encoded_len(len, true)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "base64 length overflow"))?;
        let mut encoded = vec![0u8; encoded_len];
        self.read_all(fd, &mut encoded, Some(DEFAULT_IO_TIMEOUT))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if decoded.len() != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected {len} decoded bytes, got {}", decoded.len()),
            ));
        }
        Ok(decoded)
    }
}

/// Protobuf メッセージの読み書き（トレイトオブジェクトでも使える拡張）
pub trait SocketHandlerExt: SocketHandler {
    fn write_proto<M: Message>(&self, fd: Fd, message: &M, timeout: Option<Duration>) -> io::Result<()> {
        self.write_message(fd, &message.encode_to_vec(), timeout)
    }

    fn read_proto<M: Message + Default>(&self, fd: Fd, timeout: Option<Duration>) -> io::Result<M> {
        let bytes = self.read_message(fd, timeout)?;
        M::decode(bytes.as_slice()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: SocketHandler + ?Sized> SocketHandlerExt for T {}

/// 待てば回復する I/O エラーか
pub fn is_retryable(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
