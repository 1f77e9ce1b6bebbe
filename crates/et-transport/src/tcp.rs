//! TCP ソケット実装
//!
//! ハンドルは OS の fd ではなく単調増加の番号で、再利用しない。
//! 古いハンドルで閉じ済みのソケットを誤って操作することがない。
//!
//! ストリームは `Arc` で共有し、読み書きや待機の間は表のロックを持たない。
//! 待機は unix では mio の readiness 通知で眠る。

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use mio::Interest;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, warn};

use crate::socket::{Fd, SocketEndpoint, SocketHandler};

/// 接続タイムアウト
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// close 時に未送信データを待つ時間
const LINGER: Duration = Duration::from_secs(5);

const LISTEN_BACKLOG: i32 = 128;

#[derive(Default)]
struct Inner {
    next_fd: Fd,
    streams: HashMap<Fd, Arc<TcpStream>>,
    listeners: HashMap<Fd, TcpListener>,
    endpoints: HashMap<SocketEndpoint, Vec<Fd>>,
}

impl Inner {
    fn register_stream(&mut self, stream: TcpStream) -> Fd {
        self.next_fd += 1;
        self.streams.insert(self.next_fd, Arc::new(stream));
        self.next_fd
    }
}

/// 非ブロッキング TCP の `SocketHandler`
pub struct TcpSocketHandler {
    inner: Mutex<Inner>,
    connect_timeout: Duration,
}

impl TcpSocketHandler {
    pub fn new() -> Self {
        Self::with_connect_timeout(CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        TcpSocketHandler {
            inner: Mutex::new(Inner::default()),
            connect_timeout,
        }
    }

    /// リスナーが実際に束縛したポート（ポート 0 で待ち受けた場合に使う）
    pub fn local_port(&self, fd: Fd) -> Option<u16> {
        let inner = self.inner.lock();
        if let Some(listener) = inner.listeners.get(&fd) {
            return listener.local_addr().ok().map(|addr| addr.port());
        }
        inner.streams.get(&fd)?.local_addr().ok().map(|addr| addr.port())
    }

    fn stream(&self, fd: Fd) -> io::Result<Arc<TcpStream>> {
        self.inner
            .lock()
            .streams
            .get(&fd)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown socket"))
    }

    fn wait_stream(&self, fd: Fd, interest: Interest, timeout: Duration) -> bool {
        // 未知のハンドルは待たない。続く read / write がエラーを返す
        let Ok(stream) = self.stream(fd) else {
            return true;
        };
        match wait_ready(&stream, interest, timeout) {
            Ok(ready) => ready,
            Err(e) => {
                warn!(fd, error = %e, "readiness wait failed");
                true
            }
        }
    }
}

impl Default for TcpSocketHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve(endpoint: &SocketEndpoint) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (endpoint.host.as_str(), endpoint.port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {endpoint}"),
        ));
    }
    Ok(addrs)
}

fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_linger(Some(LINGER))?;
    stream.set_nonblocking(true)
}

/// `stream` が `interest` の状態になるまで最大 `timeout` 眠る
///
/// 登録時点で既に準備できていれば即座に返る（epoll / kqueue は登録時の状態も通知する）。
#[cfg(unix)]
fn wait_ready(stream: &TcpStream, interest: Interest, timeout: Duration) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    use mio::unix::SourceFd;
    use mio::{Events, Poll, Token};

    let mut poll = Poll::new()?;
    let raw = stream.as_raw_fd();
    poll.registry().register(&mut SourceFd(&raw), Token(0), interest)?;
    let mut events = Events::with_capacity(1);
    loop {
        match poll.poll(&mut events, Some(timeout)) {
            Ok(()) => return Ok(!events.is_empty()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(not(unix))]
fn wait_ready(stream: &TcpStream, interest: Interest, timeout: Duration) -> io::Result<bool> {
    // 生の fd を mio に渡せないので短く眠って呼び出し側に再試行させる
    let _ = (stream, interest);
    std::thread::sleep(timeout.min(Duration::from_millis(5)));
    Ok(true)
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl SocketHandler for TcpSocketHandler {
    fn has_data(&self, fd: Fd) -> bool {
        let inner = self.inner.lock();
        match inner.streams.get(&fd) {
            Some(stream) => match stream.peek(&mut [0u8; 1]) {
                Ok(_) => true,
                Err(e) => e.kind() != io::ErrorKind::WouldBlock,
            },
            None => !inner.listeners.contains_key(&fd),
        }
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream(fd)?;
        (&*stream).read(buf)
    }

    fn write(&self, fd: Fd, buf: &[u8]) -> io::Result<usize> {
        let stream = self.stream(fd)?;
        (&*stream).write(buf)
    }

    fn wait_on_socket_data(&self, fd: Fd, timeout: Duration) -> bool {
        if self.has_data(fd) {
            return true;
        }
        if self.inner.lock().listeners.contains_key(&fd) {
            return false;
        }
        self.wait_stream(fd, Interest::READABLE, timeout) && self.has_data(fd)
    }

    fn wait_writable(&self, fd: Fd, timeout: Duration) -> bool {
        self.wait_stream(fd, Interest::WRITABLE, timeout)
    }

    fn connect(&self, endpoint: &SocketEndpoint) -> io::Result<Fd> {
        let mut last_err = None;
        for addr in resolve(endpoint)? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    configure_stream(&stream)?;
                    let fd = self.inner.lock().register_stream(stream);
                    debug!(%addr, fd, "connected");
                    return Ok(fd);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused)))
    }

    fn listen(&self, endpoint: &SocketEndpoint) -> io::Result<Vec<Fd>> {
        let mut bound = Vec::new();
        let mut last_err = None;
        for addr in resolve(endpoint)? {
            match bind_listener(addr) {
                Ok(listener) => bound.push(listener),
                Err(e) => {
                    warn!(%addr, error = %e, "could not listen on address");
                    last_err = Some(e);
                }
            }
        }
        if bound.is_empty() {
            return Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)));
        }

        let mut inner = self.inner.lock();
        let mut fds = Vec::with_capacity(bound.len());
        for listener in bound {
            inner.next_fd += 1;
            let fd = inner.next_fd;
            inner.listeners.insert(fd, listener);
            fds.push(fd);
        }
        inner
            .endpoints
            .entry(endpoint.clone())
            .or_default()
            .extend(fds.iter().copied());
        Ok(fds)
    }

    fn endpoint_fds(&self, endpoint: &SocketEndpoint) -> Vec<Fd> {
        self.inner.lock().endpoints.get(endpoint).cloned().unwrap_or_default()
    }

    fn accept(&self, listen_fd: Fd) -> io::Result<Option<Fd>> {
        let mut inner = self.inner.lock();
        let listener = inner
            .listeners
            .get(&listen_fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown listener"))?;
        match listener.accept() {
            Ok((stream, peer)) => {
                configure_stream(&stream)?;
                let fd = inner.register_stream(stream);
                debug!(%peer, fd, "accepted");
                Ok(Some(fd))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stop_listening(&self, endpoint: &SocketEndpoint) {
        let mut inner = self.inner.lock();
        if let Some(fds) = inner.endpoints.remove(endpoint) {
            for fd in fds {
                inner.listeners.remove(&fd);
            }
        }
    }

    fn close(&self, fd: Fd) {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.streams.remove(&fd) {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }
        if inner.listeners.remove(&fd).is_some() {
            for fds in inner.endpoints.values_mut() {
                fds.retain(|&listener| listener != fd);
            }
            inner.endpoints.retain(|_, fds| !fds.is_empty());
        }
    }

    fn active_sockets(&self) -> Vec<Fd> {
        let mut fds: Vec<Fd> = self.inner.lock().streams.keys().copied().collect();
        fds.sort_unstable();
        fds
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::socket::SocketHandler;

    fn accept_within(handler: &TcpSocketHandler, listen_fd: Fd) -> Fd {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(fd) = handler.accept(listen_fd).unwrap() {
                return fd;
            }
            assert!(Instant::now() < deadline, "no connection accepted");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_loopback_roundtrip() {
        let handler = TcpSocketHandler::new();
        let listeners = handler.listen(&SocketEndpoint::new("127.0.0.1", 0)).unwrap();
        let port = handler.local_port(listeners[0]).unwrap();

        let client = handler.connect(&SocketEndpoint::new("127.0.0.1", port)).unwrap();
        let server = accept_within(&handler, listeners[0]);

        handler.write_all(client, b"over tcp", Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 8];
        handler.read_all(server, &mut buf, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(&buf, b"over tcp");
        assert_eq!(handler.active_sockets(), vec![client, server]);
    }

    #[test]
    fn test_connect_refused() {
        let handler = TcpSocketHandler::new();
        let listeners = handler.listen(&SocketEndpoint::new("127.0.0.1", 0)).unwrap();
        let port = handler.local_port(listeners[0]).unwrap();
        handler.close(listeners[0]);

        assert!(handler.connect(&SocketEndpoint::new("127.0.0.1", port)).is_err());
    }

    #[test]
    fn test_read_unknown_fd() {
        let handler = TcpSocketHandler::new();
        let mut buf = [0u8; 1];
        assert_eq!(
            handler.read(99, &mut buf).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert!(handler.has_data(99));
        assert!(handler.wait_on_socket_data(99, Duration::from_secs(5)));
    }

    #[test]
    fn test_wait_sleeps_until_peer_writes() {
        let handler = Arc::new(TcpSocketHandler::new());
        let listeners = handler.listen(&SocketEndpoint::new("127.0.0.1", 0)).unwrap();
        let port = handler.local_port(listeners[0]).unwrap();
        let client = handler.connect(&SocketEndpoint::new("127.0.0.1", port)).unwrap();
        let server = accept_within(&handler, listeners[0]);

        let started = Instant::now();
        assert!(!handler.wait_on_socket_data(server, Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(40));

        let writer = {
            let handler = handler.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                handler.write_all(client, b"late", Some(Duration::from_secs(5))).unwrap();
            })
        };
        assert!(handler.wait_on_socket_data(server, Duration::from_secs(5)));
        writer.join().unwrap();
        let mut buf = [0u8; 4];
        handler.read_all(server, &mut buf, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(&buf, b"late");
        assert!(handler.wait_writable(client, Duration::from_secs(1)));
    }

    #[test]
    fn test_wait_wakes_on_close() {
        let handler = Arc::new(TcpSocketHandler::new());
        let listeners = handler.listen(&SocketEndpoint::new("127.0.0.1", 0)).unwrap();
        let port = handler.local_port(listeners[0]).unwrap();
        let client = handler.connect(&SocketEndpoint::new("127.0.0.1", port)).unwrap();
        let server = accept_within(&handler, listeners[0]);

        let closer = {
            let handler = handler.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                handler.close(client);
            })
        };
        assert!(handler.wait_on_socket_data(server, Duration::from_secs(5)));
        closer.join().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(handler.read(server, &mut buf).unwrap(), 0);
    }
}
