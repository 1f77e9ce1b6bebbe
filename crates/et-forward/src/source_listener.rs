//! ソース側: ローカルポートで待ち受け、接続をトンネルに載せる
//!
//! ```text
//! listen()             受け付けた接続を「未割り当て」として記録
//!                      → 呼び出し側が PortForwardDestinationRequest を送る
//! add_socket(id, fd)   相手が宛先を確保したら socket id を割り当てる
//! update(out)          割り当て済みソケットから読み、PortForwardData を積む
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use et_proto::PortForwardData;
use et_transport::{Fd, SocketEndpoint, SocketHandler};
use tracing::{error, info, warn};

use crate::error::{ForwardError, Result};
use crate::forwarded::ForwardedSocket;

/// ソース側リスナーが待ち受けるアドレス
pub const SOURCE_LISTEN_HOST: &str = "127.0.0.1";

pub struct PortForwardSourceListener {
    socket_handler: Arc<dyn SocketHandler>,
    endpoint: SocketEndpoint,
    destination_port: i32,
    unassigned_fds: BTreeSet<Fd>,
    sockets: HashMap<i32, ForwardedSocket>,
}

impl PortForwardSourceListener {
    /// `source_port` で待ち受けを開始する
    ///
    /// # エラー
    /// - `ForwardError::InvalidPort`: ポート番号が範囲外
    /// - `ForwardError::Listen`: 待ち受けソケットを作れない
    pub fn new(socket_handler: Arc<dyn SocketHandler>, source_port: i32, destination_port: i32) -> Result<Self> {
        let port = u16::try_from(source_port).map_err(|_| ForwardError::InvalidPort(source_port))?;
        let endpoint = SocketEndpoint::new(SOURCE_LISTEN_HOST, port);
        socket_handler
            .listen(&endpoint)
            .map_err(|source| ForwardError::Listen { port, source })?;
        info!(%endpoint, destination_port, "tunnel source listening");

        Ok(PortForwardSourceListener {
            socket_handler,
            endpoint,
            destination_port,
            unassigned_fds: BTreeSet::new(),
            sockets: HashMap::new(),
        })
    }

    /// 新しいローカル接続を最大 1 つ受け付ける
    pub fn listen(&mut self) -> Option<Fd> {
        for listen_fd in self.socket_handler.endpoint_fds(&self.endpoint) {
            match self.socket_handler.accept(listen_fd) {
                Ok(Some(fd)) => {
                    info!(
                        source_port = self.endpoint.port,
                        destination_port = self.destination_port,
                        fd,
                        "tunnel socket created"
                    );
                    self.unassigned_fds.insert(fd);
                    return Some(fd);
                }
                Ok(None) => {}
                Err(e) => warn!(listen_fd, error = %e, "accept failed"),
            }
        }
        None
    }

    /// 割り当て済みソケットを読み、終わったソケットを閉じる
    pub fn update(&mut self, out: &mut Vec<PortForwardData>) {
        let socket_handler = self.socket_handler.clone();
        self.sockets.retain(|_, socket| {
            let open = socket.update(socket_handler.as_ref(), out);
            if !open {
                socket_handler.close(socket.fd());
            }
            open
        });
    }

    pub fn source_port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn destination_port(&self) -> i32 {
        self.destination_port
    }

    pub fn has_unassigned_fd(&self, fd: Fd) -> bool {
        self.unassigned_fds.contains(&fd)
    }

    pub fn close_unassigned_fd(&mut self, fd: Fd) {
        if !self.unassigned_fds.remove(&fd) {
            error!(fd, "tried to close an unassigned fd that doesn't exist");
            return;
        }
        self.socket_handler.close(fd);
    }

    /// 未割り当てのハンドルに socket id を結びつける
    pub fn add_socket(&mut self, socket_id: i32, fd: Fd) {
        if !self.unassigned_fds.remove(&fd) {
            error!(socket_id, fd, "tried to assign a socket id to an unknown fd");
            return;
        }
        info!(socket_id, fd, "adding socket");
        self.sockets.insert(socket_id, ForwardedSocket::new(fd, socket_id, true));
    }

    pub fn has_socket(&self, socket_id: i32) -> bool {
        self.sockets.contains_key(&socket_id)
    }

    pub fn send_data_on_socket(&mut self, socket_id: i32, data: &[u8]) {
        match self.sockets.get_mut(&socket_id) {
            Some(socket) => socket.write(self.socket_handler.as_ref(), data),
            None => error!(socket_id, "tried to write to a socket that no longer exists"),
        }
    }

    pub fn close_socket(&mut self, socket_id: i32) {
        match self.sockets.remove(&socket_id) {
            Some(socket) => self.socket_handler.close(socket.fd()),
            None => error!(socket_id, "tried to remove a socket that no longer exists"),
        }
    }
}

impl Drop for PortForwardSourceListener {
    fn drop(&mut self) {
        for fd in std::mem::take(&mut self.unassigned_fds) {
            self.socket_handler.close(fd);
        }
        for (_, socket) in self.sockets.drain() {
            self.socket_handler.close(socket.fd());
        }
        self.socket_handler.stop_listening(&self.endpoint);
    }
}
