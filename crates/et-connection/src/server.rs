//! サーバー側: 待ち受けとクライアントの受け入れ
//!
//! `ServerConnection` は登録済みクライアント ID → パスキーと
//! ID → `ServerClientConnection` の 2 つの表を所有する。

use std::collections::HashMap;
use std::sync::Arc;

use et_crypto::{CryptoError, KEY_LEN};
use et_proto::{ConnectResponse, ConnectStatus, PROTOCOL_VERSION};
use et_transport::{Fd, SocketEndpoint, SocketHandler};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, Result};
use crate::handshake::{read_connect_request, send_connect_response};
use crate::server_client::{passkeys_match, ServerClientConnection};

/// 共有されるクライアントコネクション
pub type SharedClientConnection = Arc<Mutex<ServerClientConnection>>;

/// 新規クライアントの受け入れ判断
///
/// `false` を返すとクライアントは登録ごと削除される。
pub trait ClientAdmission: Send {
    fn new_client(&mut self, connection: &SharedClientConnection) -> bool;
}

impl<F> ClientAdmission for F
where
    F: FnMut(&SharedClientConnection) -> bool + Send,
{
    fn new_client(&mut self, connection: &SharedClientConnection) -> bool {
        self(connection)
    }
}

/// すべて受け入れる
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ClientAdmission for AcceptAll {
    fn new_client(&mut self, _: &SharedClientConnection) -> bool {
        true
    }
}

pub struct ServerConnection {
    socket_handler: Arc<dyn SocketHandler>,
    endpoint: SocketEndpoint,
    config: ConnectionConfig,
    client_keys: HashMap<String, String>,
    client_connections: HashMap<String, SharedClientConnection>,
    admission: Box<dyn ClientAdmission>,
}

impl ServerConnection {
    pub fn new(
        socket_handler: Arc<dyn SocketHandler>,
        endpoint: SocketEndpoint,
        admission: impl ClientAdmission + 'static,
        config: ConnectionConfig,
    ) -> Self {
        ServerConnection {
            socket_handler,
            endpoint,
            config,
            client_keys: HashMap::new(),
            client_connections: HashMap::new(),
            admission: Box::new(admission),
        }
    }

    /// 待ち受けを開始する
    ///
    /// # エラー
    /// 待ち受けソケットを作れない場合（致命的）
    pub fn listen(&mut self) -> Result<Vec<Fd>> {
        let fds = self.socket_handler.listen(&self.endpoint)?;
        info!(endpoint = %self.endpoint, ?fds, "listening");
        Ok(fds)
    }

    /// 待機中の接続をすべて受け付けてハンドシェイクする。処理した数を返す。
    pub fn accept_new_connections(&mut self) -> usize {
        let mut handled = 0;
        for listen_fd in self.socket_handler.endpoint_fds(&self.endpoint) {
            loop {
                match self.socket_handler.accept(listen_fd) {
                    Ok(Some(fd)) => {
                        self.client_handler(fd);
                        handled += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(listen_fd, error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
        handled
    }

    /// 受け付けたソケット 1 本の接続ハンドシェイクを処理する
    ///
    /// 返したステータスを返す。要求を読めなかった場合は `None`。
    pub fn client_handler(&mut self, fd: Fd) -> Option<ConnectStatus> {
        let timeout = self.config.handshake_timeout();
        let request = match read_connect_request(self.socket_handler.as_ref(), fd, timeout) {
            Ok(request) => request,
            Err(e) => {
                warn!(fd, error = %e, "could not read connect request");
                self.socket_handler.close(fd);
                return None;
            }
        };
        let client_id = request.client_id;

        if request.version != PROTOCOL_VERSION {
            warn!(%client_id, version = request.version, "protocol version mismatch");
            let message = format!(
                "Mismatched protocol: client {} server {}",
                request.version, PROTOCOL_VERSION
            );
            self.reject(fd, ConnectStatus::MismatchedProtocol, message);
            return Some(ConnectStatus::MismatchedProtocol);
        }

        let Some(key) = self.client_keys.get(&client_id).cloned() else {
            info!(%client_id, "rejecting unregistered client");
            self.reject(fd, ConnectStatus::InvalidKey, "Client is not registered".to_string());
            return Some(ConnectStatus::InvalidKey);
        };

        if let Some(existing) = self.client_connections.get(&client_id).cloned() {
            let terminated = existing.lock().is_shutting_down();
            if terminated {
                info!(%client_id, "session already terminated, evicting client");
                self.remove_client(&client_id);
                self.reject(fd, ConnectStatus::InvalidKey, "Session was terminated".to_string());
                return Some(ConnectStatus::InvalidKey);
            }
            if !self.respond(fd, ConnectStatus::ReturningClient) {
                return None;
            }
            info!(%client_id, fd, "client returning");
            let recovered = existing.lock().recover_client(fd);
            if !recovered {
                warn!(%client_id, "returning client could not be recovered");
                // 致命的な失敗なら次の再接続で INVALID_KEY を返せるよう消しておく
                let terminated = existing.lock().is_shutting_down();
                if terminated {
                    self.remove_client(&client_id);
                }
            }
            return Some(ConnectStatus::ReturningClient);
        }

        if !self.respond(fd, ConnectStatus::NewClient) {
            return None;
        }
        let connection = match ServerClientConnection::new(
            self.socket_handler.clone(),
            client_id.clone(),
            key,
            fd,
            self.config.clone(),
        ) {
            Ok(connection) => Arc::new(Mutex::new(connection)),
            Err(e) => {
                error!(%client_id, error = %e, "could not create client connection");
                self.socket_handler.close(fd);
                return None;
            }
        };
        self.client_connections.insert(client_id.clone(), connection.clone());
        info!(%client_id, fd, "new client");

        if !self.admission.new_client(&connection) {
            info!(%client_id, "client rejected by admission policy");
            self.remove_client(&client_id);
        }
        Some(ConnectStatus::NewClient)
    }

    fn respond(&self, fd: Fd, status: ConnectStatus) -> bool {
        let response = ConnectResponse::new(status);
        match send_connect_response(self.socket_handler.as_ref(), fd, &response, self.config.handshake_timeout()) {
            Ok(()) => true,
            Err(e) => {
                warn!(fd, ?status, error = %e, "could not send connect response");
                self.socket_handler.close(fd);
                false
            }
        }
    }

    fn reject(&self, fd: Fd, status: ConnectStatus, message: String) {
        let response = ConnectResponse::with_error(status, message);
        if let Err(e) = send_connect_response(self.socket_handler.as_ref(), fd, &response, self.config.handshake_timeout()) {
            debug!(fd, error = %e, "could not deliver rejection");
        }
        self.socket_handler.close(fd);
    }

    /// クライアント ID とパスキーを登録する
    ///
    /// # エラー
    /// - `ConnectionError::PasskeyMismatch`: 登録済み ID に別のパスキー
    /// - `ConnectionError::Crypto`: パスキーが 32 バイトでない
    pub fn add_client_key(&mut self, id: impl Into<String>, passkey: impl Into<String>) -> Result<()> {
        let id = id.into();
        let passkey = passkey.into();
        if passkey.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: passkey.len(),
            }
            .into());
        }
        if let Some(connection) = self.client_connections.get(&id) {
            if !connection.lock().verify_passkey(&passkey) {
                return Err(ConnectionError::PasskeyMismatch(id));
            }
        }
        match self.client_keys.get(&id) {
            Some(existing) if !passkeys_match(existing, &passkey) => Err(ConnectionError::PasskeyMismatch(id)),
            Some(_) => Ok(()),
            None => {
                debug!(client_id = %id, "registered client key");
                self.client_keys.insert(id, passkey);
                Ok(())
            }
        }
    }

    pub fn client_key_exists(&self, id: &str) -> bool {
        self.client_keys.contains_key(id)
    }

    pub fn client_connection_exists(&self, id: &str) -> bool {
        self.client_connections.contains_key(id)
    }

    pub fn client_connection(&self, id: &str) -> Option<SharedClientConnection> {
        self.client_connections.get(id).cloned()
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.client_connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// クライアントの登録とコネクションを削除する
    pub fn remove_client(&mut self, id: &str) -> bool {
        let had_key = self.client_keys.remove(id).is_some();
        match self.client_connections.remove(id) {
            Some(connection) => {
                connection.lock().shutdown();
                info!(client_id = id, "removed client");
                true
            }
            None => had_key,
        }
    }

    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// 待ち受けを止め、すべてのクライアントを終了する
    pub fn shutdown(&mut self) {
        self.socket_handler.stop_listening(&self.endpoint);
        for (id, connection) in self.client_connections.drain() {
            debug!(client_id = %id, "shutting down client");
            connection.lock().shutdown();
        }
        self.client_keys.clear();
    }
}
