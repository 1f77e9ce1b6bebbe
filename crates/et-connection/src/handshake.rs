//! 接続ハンドシェイク
//!
//! ```text
//! client                         server
//!   ── ConnectRequest{id, ver} ──▶
//!   ◀── ConnectResponse{status} ──
//!        NEW_CLIENT        → 新規セッション
//!        RETURNING_CLIENT  → 続けて再接続ハンドシェイク（SequenceHeader / CatchupBuffer）
//!        INVALID_KEY / MISMATCHED_PROTOCOL → 切断
//! ```

use std::time::Duration;

use et_proto::{ConnectRequest, ConnectResponse, ConnectStatus};
use et_transport::{Fd, SocketHandler, SocketHandlerExt};
use tracing::debug;

use crate::error::{ConnectionError, Result};

/// クライアント側: 接続要求を送り、受け入れられたステータスを返す
///
/// # エラー
/// - `ConnectionError::Rejected`: `NEW_CLIENT` / `RETURNING_CLIENT` 以外の応答
/// - `ConnectionError::Io`: 送受信失敗（タイムアウトを含む）
pub fn request_admission(
    socket_handler: &dyn SocketHandler,
    fd: Fd,
    client_id: &str,
    timeout: Duration,
) -> Result<ConnectStatus> {
    socket_handler.write_proto(fd, &ConnectRequest::new(client_id), Some(timeout))?;
    let response: ConnectResponse = socket_handler.read_proto(fd, Some(timeout))?;
    let status = response.connect_status()?;
    debug!(client_id, fd, ?status, "connect response");

    match status {
        ConnectStatus::NewClient | ConnectStatus::ReturningClient => Ok(status),
        rejected => Err(ConnectionError::Rejected {
            status: rejected,
            message: response.error.unwrap_or_default(),
        }),
    }
}

/// サーバー側: 接続要求を 1 つ読む
pub fn read_connect_request(
    socket_handler: &dyn SocketHandler,
    fd: Fd,
    timeout: Duration,
) -> Result<ConnectRequest> {
    Ok(socket_handler.read_proto(fd, Some(timeout))?)
}

/// サーバー側: 応答を送る
pub fn send_connect_response(
    socket_handler: &dyn SocketHandler,
    fd: Fd,
    response: &ConnectResponse,
    timeout: Duration,
) -> Result<()> {
    Ok(socket_handler.write_proto(fd, response, Some(timeout))?)
}

#[cfg(test)]
mod tests {
    use et_transport::InMemorySocketHandler;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_accepted_status() {
        let handler = InMemorySocketHandler::new();
        let (client, server) = handler.create_pair();
        send_connect_response(&handler, server, &ConnectResponse::new(ConnectStatus::ReturningClient), TIMEOUT)
            .unwrap();

        let status = request_admission(&handler, client, "abc", TIMEOUT).unwrap();
        assert_eq!(status, ConnectStatus::ReturningClient);

        let request = read_connect_request(&handler, server, TIMEOUT).unwrap();
        assert_eq!(request.client_id, "abc");
        assert_eq!(request.version, et_proto::PROTOCOL_VERSION);
    }

    #[test]
    fn test_rejected_status_carries_message() {
        let handler = InMemorySocketHandler::new();
        let (client, server) = handler.create_pair();
        let response = ConnectResponse::with_error(ConnectStatus::InvalidKey, "Client is not registered");
        send_connect_response(&handler, server, &response, TIMEOUT).unwrap();

        match request_admission(&handler, client, "abc", TIMEOUT) {
            Err(ConnectionError::Rejected { status, message }) => {
                assert_eq!(status, ConnectStatus::InvalidKey);
                assert_eq!(message, "Client is not registered");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_silent_server_times_out() {
        let handler = InMemorySocketHandler::new();
        let (client, _server) = handler.create_pair();
        let result = request_admission(&handler, client, "abc", Duration::from_millis(20));
        assert!(matches!(result, Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut));
    }
}
