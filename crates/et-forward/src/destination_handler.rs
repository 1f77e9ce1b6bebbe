//! 宛先側: 最終的な接続先へのソケット 1 本

use std::sync::Arc;

use et_proto::PortForwardData;
use et_transport::{Fd, SocketHandler};
use tracing::{debug, info};

use crate::forwarded::ForwardedSocket;

pub struct PortForwardDestinationHandler {
    socket_handler: Arc<dyn SocketHandler>,
    socket: Option<ForwardedSocket>,
    socket_id: i32,
}

impl PortForwardDestinationHandler {
    pub fn new(socket_handler: Arc<dyn SocketHandler>, fd: Fd, socket_id: i32) -> Self {
        PortForwardDestinationHandler {
            socket_handler,
            socket: Some(ForwardedSocket::new(fd, socket_id, false)),
            socket_id,
        }
    }

    /// 宛先から読めるだけ読み `out` に積む。終わっていれば閉じる。
    pub fn update(&mut self, out: &mut Vec<PortForwardData>) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        if !socket.update(self.socket_handler.as_ref(), out) {
            debug!(socket_id = self.socket_id, "destination socket finished");
            self.close();
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        match self.socket.as_mut() {
            Some(socket) => socket.write(self.socket_handler.as_ref(), data),
            None => debug!(socket_id = self.socket_id, "dropping data for closed destination"),
        }
    }

    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            info!(socket_id = self.socket_id, fd = socket.fd(), "closing destination socket");
            self.socket_handler.close(socket.fd());
        }
    }

    /// 閉じていれば `None`
    pub fn fd(&self) -> Option<Fd> {
        self.socket.as_ref().map(ForwardedSocket::fd)
    }

    pub fn socket_id(&self) -> i32 {
        self.socket_id
    }
}

impl Drop for PortForwardDestinationHandler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use et_transport::InMemorySocketHandler;

    use super::*;

    #[test]
    fn test_round_trip() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let (service, fd) = handler.create_pair();
        let mut destination = PortForwardDestinationHandler::new(handler.clone(), fd, 11);

        destination.write(b"request");
        let mut buf = [0u8; 7];
        handler.read_all(service, &mut buf, None).unwrap();
        assert_eq!(&buf, b"request");

        handler.write(service, b"response").unwrap();
        let mut out = Vec::new();
        destination.update(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].socket_id, 11);
        assert!(!out[0].source_to_destination);
        assert_eq!(out[0].buffer.as_deref(), Some(&b"response"[..]));
    }

    #[test]
    fn test_peer_close_closes_handler() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let (service, fd) = handler.create_pair();
        let mut destination = PortForwardDestinationHandler::new(handler.clone(), fd, 11);

        handler.close(service);
        let mut out = Vec::new();
        destination.update(&mut out);
        assert_eq!(out[0].closed, Some(true));
        assert_eq!(destination.fd(), None);
        assert!(!handler.is_open(fd));

        // 閉じた後は何もしない
        destination.write(b"ignored");
        destination.update(&mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_write_failure_reported_on_update() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let (service, fd) = handler.create_pair();
        let mut destination = PortForwardDestinationHandler::new(handler.clone(), fd, 5);

        handler.close(service);
        destination.write(b"lost");
        let mut out = Vec::new();
        destination.update(&mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].error.is_some());
        assert_eq!(destination.fd(), None);
    }
}
