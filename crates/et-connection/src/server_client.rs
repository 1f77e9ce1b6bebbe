//! サーバー側のクライアント 1 件分のコネクション

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use et_transport::{Fd, Packet, SocketHandler};
use subtle::ConstantTimeEq;

use crate::config::ConnectionConfig;
use crate::connection::{write_timed_out, Connection, Role, WaitForPeer};
use crate::error::Result;
use crate::server::SharedClientConnection;

/// パスキーを定数時間で比較する
pub(crate) fn passkeys_match(stored: &str, candidate: &str) -> bool {
    stored.as_bytes().ct_eq(candidate.as_bytes()).into()
}

/// サーバー側のクライアントコネクション
///
/// 切断されても自分からは再接続せず、クライアントが `RETURNING_CLIENT` として
/// 戻ってきたときに `recover_client` で再開する。
pub struct ServerClientConnection {
    connection: Connection,
}

impl ServerClientConnection {
    pub fn new(
        socket_handler: Arc<dyn SocketHandler>,
        client_id: impl Into<String>,
        key: impl Into<String>,
        fd: Fd,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let mut connection = Connection::new(
            socket_handler,
            client_id,
            key,
            Role::Server,
            Box::new(WaitForPeer),
            config,
        )?;
        connection.attach(fd);
        Ok(ServerClientConnection { connection })
    }

    /// 候補のパスキーが登録済みのものと一致するか
    pub fn verify_passkey(&self, candidate: &str) -> bool {
        passkeys_match(self.connection.key(), candidate)
    }

    /// 戻ってきたクライアントのソケットで再開する
    pub fn recover_client(&mut self, fd: Fd) -> bool {
        self.connection.recover(fd)
    }
}

/// 共有コネクションに受け付けられるまで書き込みを繰り返す
///
/// ロックは 1 回の試行ごとに取り直す。待っている間にクライアントが戻ってくれば
/// `ServerConnection` が同じコネクションで再接続ハンドシェイクを行える。
pub fn write_shared_packet(connection: &SharedClientConnection, packet: &Packet, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let attempt = connection.lock().try_write_packet(packet);
        let Some(pause) = attempt? else {
            return Ok(());
        };
        if Instant::now() >= deadline {
            return Err(write_timed_out());
        }
        thread::sleep(pause);
    }
}

impl Deref for ServerClientConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl DerefMut for ServerClientConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}

#[cfg(test)]
mod tests {
    use et_transport::InMemorySocketHandler;

    use super::*;

    const KEY: &str = "12345678901234567890123456789012";

    #[test]
    fn test_verify_passkey() {
        let handler = Arc::new(InMemorySocketHandler::new());
        let (_client, server) = handler.create_pair();
        let connection =
            ServerClientConnection::new(handler, "id", KEY, server, ConnectionConfig::default()).unwrap();

        assert!(connection.verify_passkey(KEY));
        assert!(!connection.verify_passkey("12345678901234567890123456789013"));
        assert!(!connection.verify_passkey("1234"));
        assert!(connection.is_connected());
    }

    #[test]
    fn test_passkeys_match() {
        assert!(passkeys_match("abc", "abc"));
        assert!(!passkeys_match("abc", "abd"));
        assert!(!passkeys_match("abc", "abcd"));
    }
}
