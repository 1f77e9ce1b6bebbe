//! メモリ内ソケット実装（テスト用）
//!
//! 接続ペア・ループバック・リスナーをすべてプロセス内のキューで再現する。
//! 相手側を閉じると読み出しは EOF（`Ok(0)`）、書き込みは `BrokenPipe` になる。
//! 状態が変わるたびに条件変数で待機中のスレッドを起こす。

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::socket::{Fd, SocketEndpoint, SocketHandler};

struct Channel {
    /// `None` はループバック（自分に書いたものを自分で読む）
    peer: Option<Fd>,
    inbound: VecDeque<u8>,
}

struct Listener {
    endpoint: SocketEndpoint,
    pending: VecDeque<Fd>,
}

#[derive(Default)]
struct Inner {
    next_fd: Fd,
    channels: HashMap<Fd, Channel>,
    listeners: HashMap<Fd, Listener>,
    endpoints: HashMap<SocketEndpoint, Fd>,
}

impl Inner {
    fn allocate(&mut self) -> Fd {
        self.next_fd += 1;
        self.next_fd
    }

    fn new_pair(&mut self) -> (Fd, Fd) {
        let a = self.allocate();
        let b = self.allocate();
        self.channels.insert(a, Channel { peer: Some(b), inbound: VecDeque::new() });
        self.channels.insert(b, Channel { peer: Some(a), inbound: VecDeque::new() });
        (a, b)
    }

    fn peer_gone(&self, channel: &Channel) -> bool {
        match channel.peer {
            Some(peer) => !self.channels.contains_key(&peer),
            None => false,
        }
    }

    fn readable(&self, fd: Fd) -> bool {
        match self.channels.get(&fd) {
            Some(channel) => !channel.inbound.is_empty() || self.peer_gone(channel),
            None => !self.listeners.contains_key(&fd),
        }
    }
}

/// プロセス内キューで動く `SocketHandler`
#[derive(Default)]
pub struct InMemorySocketHandler {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl InMemorySocketHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 互いに接続されたハンドルの組を作る
    pub fn create_pair(&self) -> (Fd, Fd) {
        self.inner.lock().new_pair()
    }

    /// 書いたバイトが同じハンドルから読めるハンドルを作る
    pub fn create_loopback(&self) -> Fd {
        let mut inner = self.inner.lock();
        let fd = inner.allocate();
        inner.channels.insert(fd, Channel { peer: None, inbound: VecDeque::new() });
        fd
    }

    /// 相手から届いたかのようにバイト列を積む
    pub fn inject(&self, fd: Fd, bytes: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let channel = inner.channels.get_mut(&fd).ok_or_else(not_connected)?;
        channel.inbound.extend(bytes.iter().copied());
        self.changed.notify_all();
        Ok(())
    }

    /// 未読のバイト数
    pub fn pending_bytes(&self, fd: Fd) -> usize {
        self.inner
            .lock()
            .channels
            .get(&fd)
            .map_or(0, |channel| channel.inbound.len())
    }

    pub fn is_open(&self, fd: Fd) -> bool {
        self.inner.lock().channels.contains_key(&fd)
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "unknown or closed socket")
}

impl SocketHandler for InMemorySocketHandler {
    fn has_data(&self, fd: Fd) -> bool {
        self.inner.lock().readable(fd)
    }

    fn wait_on_socket_data(&self, fd: Fd, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while !inner.readable(fd) {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.readable(fd);
            }
        }
        true
    }

    /// 書き込みは常に即座に完了する
    fn wait_writable(&self, _fd: Fd, _timeout: Duration) -> bool {
        true
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        let gone = match inner.channels.get(&fd) {
            Some(channel) => inner.peer_gone(channel),
            None => return Err(not_connected()),
        };
        let channel = inner.channels.get_mut(&fd).ok_or_else(not_connected)?;
        if channel.inbound.is_empty() {
            if gone || buf.is_empty() {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = buf.len().min(channel.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(channel.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, fd: Fd, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        let target = match inner.channels.get(&fd) {
            Some(channel) => channel.peer.unwrap_or(fd),
            None => return Err(not_connected()),
        };
        match inner.channels.get_mut(&target) {
            Some(peer) => {
                peer.inbound.extend(buf.iter().copied());
                self.changed.notify_all();
                Ok(buf.len())
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed")),
        }
    }

    fn connect(&self, endpoint: &SocketEndpoint) -> io::Result<Fd> {
        let mut inner = self.inner.lock();
        let listen_fd = *inner.endpoints.get(endpoint).ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing listening on {endpoint}"))
        })?;
        let (client, server) = inner.new_pair();
        if let Some(listener) = inner.listeners.get_mut(&listen_fd) {
            listener.pending.push_back(server);
        }
        trace!(%endpoint, client, server, "in-memory connect");
        Ok(client)
    }

    fn listen(&self, endpoint: &SocketEndpoint) -> io::Result<Vec<Fd>> {
        let mut inner = self.inner.lock();
        if inner.endpoints.contains_key(endpoint) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("{endpoint} already listening")));
        }
        let fd = inner.allocate();
        inner.listeners.insert(
            fd,
            Listener {
                endpoint: endpoint.clone(),
                pending: VecDeque::new(),
            },
        );
        inner.endpoints.insert(endpoint.clone(), fd);
        Ok(vec![fd])
    }

    fn endpoint_fds(&self, endpoint: &SocketEndpoint) -> Vec<Fd> {
        self.inner.lock().endpoints.get(endpoint).copied().into_iter().collect()
    }

    fn accept(&self, listen_fd: Fd) -> io::Result<Option<Fd>> {
        let mut inner = self.inner.lock();
        let listener = inner.listeners.get_mut(&listen_fd).ok_or_else(not_connected)?;
        Ok(listener.pending.pop_front())
    }

    fn stop_listening(&self, endpoint: &SocketEndpoint) {
        let fd = self.inner.lock().endpoints.get(endpoint).copied();
        if let Some(fd) = fd {
            self.close(fd);
        }
    }

    fn close(&self, fd: Fd) {
        let mut inner = self.inner.lock();
        if inner.channels.remove(&fd).is_some() {
            // 相手側の読み手は EOF で起きる
            self.changed.notify_all();
            return;
        }
        if let Some(listener) = inner.listeners.remove(&fd) {
            inner.endpoints.remove(&listener.endpoint);
            for pending in listener.pending {
                inner.channels.remove(&pending);
            }
            self.changed.notify_all();
        }
    }

    fn active_sockets(&self) -> Vec<Fd> {
        let mut fds: Vec<Fd> = self.inner.lock().channels.keys().copied().collect();
        fds.sort_unstable();
        fds
    }
}
