//! クライアント側コネクション

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use et_proto::ConnectStatus;
use et_transport::{SocketEndpoint, SocketHandler};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ReconnectStrategy, RedialOutcome, Role};
use crate::error::{ConnectionError, Result};
use crate::handshake::request_admission;

/// 切断時にサーバーへ再接続し、`RETURNING_CLIENT` を得たら再開する
#[derive(Debug, Clone)]
pub struct ClientRedial {
    endpoint: SocketEndpoint,
}

impl ClientRedial {
    pub fn new(endpoint: SocketEndpoint) -> Self {
        ClientRedial { endpoint }
    }
}

impl ReconnectStrategy for ClientRedial {
    fn redial(
        &mut self,
        socket_handler: &Arc<dyn SocketHandler>,
        client_id: &str,
        config: &ConnectionConfig,
    ) -> RedialOutcome {
        let fd = match socket_handler.connect(&self.endpoint) {
            Ok(fd) => fd,
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "reconnect attempt failed");
                return RedialOutcome::RetryLater;
            }
        };

        match request_admission(socket_handler.as_ref(), fd, client_id, config.handshake_timeout()) {
            Ok(ConnectStatus::ReturningClient) => RedialOutcome::Ready(fd),
            Ok(status) => {
                warn!(client_id, ?status, "server no longer knows this session");
                socket_handler.close(fd);
                RedialOutcome::SessionTerminated
            }
            Err(ConnectionError::Rejected { status, message }) => {
                info!(client_id, ?status, %message, "server refused reconnect, assuming the session was terminated");
                socket_handler.close(fd);
                RedialOutcome::SessionTerminated
            }
            Err(e) => {
                debug!(client_id, error = %e, "reconnect handshake failed");
                socket_handler.close(fd);
                RedialOutcome::RetryLater
            }
        }
    }
}

/// クライアント側コネクション
pub struct ClientConnection {
    connection: Connection,
    endpoint: SocketEndpoint,
}

impl ClientConnection {
    pub fn new(
        socket_handler: Arc<dyn SocketHandler>,
        endpoint: SocketEndpoint,
        id: impl Into<String>,
        key: impl Into<String>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let strategy = Box::new(ClientRedial::new(endpoint.clone()));
        let connection = Connection::new(socket_handler, id, key, Role::Client, strategy, config)?;
        Ok(ClientConnection { connection, endpoint })
    }

    /// サーバーに接続して受け入れられたステータスを返す
    ///
    /// `RETURNING_CLIENT` の場合はそのまま再接続ハンドシェイクまで行う。
    ///
    /// # エラー
    /// - `ConnectionError::Rejected`: `INVALID_KEY` など
    /// - `ConnectionError::Io`: 接続・送受信の失敗
    pub fn connect(&mut self) -> Result<ConnectStatus> {
        let handler = self.socket_handler();
        let fd = handler.connect(&self.endpoint)?;
        let timeout = self.connection.config().handshake_timeout();

        match request_admission(handler.as_ref(), fd, self.connection.id(), timeout) {
            Ok(ConnectStatus::ReturningClient) => {
                self.connection.try_recover(fd)?;
                Ok(ConnectStatus::ReturningClient)
            }
            Ok(status) => {
                info!(id = %self.connection.id(), fd, "connected as new client");
                self.connection.attach(fd);
                Ok(status)
            }
            Err(e) => {
                handler.close(fd);
                Err(e)
            }
        }
    }

    fn socket_handler(&self) -> Arc<dyn SocketHandler> {
        self.connection.socket_handler().clone()
    }

    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    pub fn into_inner(self) -> Connection {
        self.connection
    }
}

impl Deref for ClientConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl DerefMut for ClientConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}
