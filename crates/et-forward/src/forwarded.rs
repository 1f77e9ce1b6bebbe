//! トンネルに結びついたローカルソケット 1 本

use et_proto::PortForwardData;
use et_transport::{is_retryable, Fd, SocketHandler};
use tracing::{debug, trace, warn};

use crate::write_buffer::WriteBuffer;

/// 1 回の読み出しで読む最大バイト数
const READ_CHUNK: usize = 1024;

pub(crate) struct ForwardedSocket {
    fd: Fd,
    socket_id: i32,
    /// このソケットから読んだデータの向き
    source_to_destination: bool,
    outbound: WriteBuffer,
    /// 次の `update` で相手に伝えるエラー
    failure: Option<String>,
}

impl ForwardedSocket {
    pub(crate) fn new(fd: Fd, socket_id: i32, source_to_destination: bool) -> Self {
        ForwardedSocket {
            fd,
            socket_id,
            source_to_destination,
            outbound: WriteBuffer::new(),
            failure: None,
        }
    }

    pub(crate) fn fd(&self) -> Fd {
        self.fd
    }

    /// トンネル越しに届いたデータをローカルソケットへ書く
    pub(crate) fn write(&mut self, socket_handler: &dyn SocketHandler, data: &[u8]) {
        if self.failure.is_some() {
            return;
        }
        if !self.outbound.enqueue(data) {
            warn!(socket_id = self.socket_id, pending = self.outbound.len(), "local write buffer overflow");
            self.failure = Some("write buffer overflow".to_string());
            return;
        }
        if let Err(e) = self.outbound.flush(socket_handler, self.fd) {
            debug!(socket_id = self.socket_id, error = %e, "local write failed");
            self.failure = Some(e.to_string());
        }
    }

    /// 溜まった書き込みを流し、読めるだけ読んで `out` に積む
    ///
    /// ソケットが終わった（EOF・エラー）場合は `false`。ハンドルは閉じない。
    pub(crate) fn update(&mut self, socket_handler: &dyn SocketHandler, out: &mut Vec<PortForwardData>) -> bool {
        if self.failure.is_none() && !self.outbound.is_empty() {
            if let Err(e) = self.outbound.flush(socket_handler, self.fd) {
                self.failure = Some(e.to_string());
            }
        }
        if let Some(error) = self.failure.take() {
            out.push(PortForwardData::with_error(self.socket_id, self.source_to_destination, error));
            return false;
        }

        let mut buf = [0u8; READ_CHUNK];
        while socket_handler.has_data(self.fd) {
            match socket_handler.read(self.fd, &mut buf) {
                Ok(0) => {
                    debug!(socket_id = self.socket_id, "local socket closed");
                    out.push(PortForwardData::with_closed(self.socket_id, self.source_to_destination));
                    return false;
                }
                Ok(n) => {
                    trace!(socket_id = self.socket_id, bytes = n, "read from local socket");
                    out.push(PortForwardData::with_buffer(
                        self.socket_id,
                        self.source_to_destination,
                        buf[..n].to_vec(),
                    ));
                }
                Err(e) if is_retryable(&e) => break,
                Err(e) => {
                    debug!(socket_id = self.socket_id, error = %e, "error reading local socket");
                    out.push(PortForwardData::with_error(
                        self.socket_id,
                        self.source_to_destination,
                        e.to_string(),
                    ));
                    return false;
                }
            }
        }
        true
    }
}
