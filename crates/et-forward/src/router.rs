//! ポートフォワードの振り分け
//!
//! socket id → 所有するリスナー / 宛先ハンドラの表を持ち、
//! `Connection` 上を流れるポートフォワード用パケットを処理する。
//!
//! ```text
//! ソース側                                   宛先側
//!  listen() ── PortForwardDestinationRequest{port, fd} ──▶ create_destination()
//!           ◀── PortForwardDestinationResponse{fd, id} ──  （::1 → 127.0.0.1 の順に接続）
//!  add_source_socket_id(id, fd)
//!  update() ── PortForwardData{id, src→dst} ──────────────▶ 宛先ソケットへ書く
//!           ◀── PortForwardData{id, dst→src} ─────────────  update()
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use et_connection::Connection;
use et_proto::{
    decode_from_bytes, encode_to_bytes, PacketType, PortForwardData, PortForwardDestinationRequest,
    PortForwardDestinationResponse, PortForwardSourceRequest, PortForwardSourceResponse,
};
use et_transport::{Fd, Packet, SocketEndpoint, SocketHandler};
use prost::Message;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::destination_handler::PortForwardDestinationHandler;
use crate::error::{ForwardError, Result};
use crate::source_listener::PortForwardSourceListener;

/// 空き socket id を探す試行回数の既定値
pub const MAX_SOCKET_ID_ATTEMPTS: usize = 100_000;

/// 宛先への接続を試す順序
const DESTINATION_HOSTS: [&str; 2] = ["::1", "127.0.0.1"];

pub struct PortForwardRouter {
    socket_handler: Arc<dyn SocketHandler>,
    source_listeners: Vec<PortForwardSourceListener>,
    /// socket id → `source_listeners` の添字
    source_socket_ids: HashMap<i32, usize>,
    destination_handlers: HashMap<i32, PortForwardDestinationHandler>,
    rng: Box<dyn RngCore + Send>,
    max_socket_id_attempts: usize,
    /// 未送信のパケット（切断中に溜まる）
    outbox: VecDeque<Packet>,
}

impl PortForwardRouter {
    pub fn new(socket_handler: Arc<dyn SocketHandler>) -> Self {
        Self::with_rng(socket_handler, StdRng::from_entropy(), MAX_SOCKET_ID_ATTEMPTS)
    }

    /// socket id の乱数源と試行回数を指定して作る
    pub fn with_rng(
        socket_handler: Arc<dyn SocketHandler>,
        rng: impl RngCore + Send + 'static,
        max_socket_id_attempts: usize,
    ) -> Self {
        PortForwardRouter {
            socket_handler,
            source_listeners: Vec::new(),
            source_socket_ids: HashMap::new(),
            destination_handlers: HashMap::new(),
            rng: Box::new(rng),
            max_socket_id_attempts,
            outbox: VecDeque::new(),
        }
    }

    /// すべてのリスナーと宛先を 1 回ずつ更新する
    ///
    /// 新しいローカル接続は `requests` に、読んだデータは `data` に積まれる。
    pub fn update(&mut self, requests: &mut Vec<PortForwardDestinationRequest>, data: &mut Vec<PortForwardData>) {
        for listener in &mut self.source_listeners {
            listener.update(data);
            if let Some(fd) = listener.listen() {
                requests.push(PortForwardDestinationRequest {
                    port: listener.destination_port(),
                    fd,
                });
            }
        }

        for handler in self.destination_handlers.values_mut() {
            handler.update(data);
        }
        self.destination_handlers.retain(|socket_id, handler| {
            let open = handler.fd().is_some();
            if !open {
                debug!(socket_id, "removing closed destination");
            }
            open
        });

        // ソース側で閉じたソケットの id を表から外す
        let listeners = &self.source_listeners;
        self.source_socket_ids
            .retain(|socket_id, index| listeners.get(*index).is_some_and(|l| l.has_socket(*socket_id)));
    }

    /// リスナーを作る（相手からのリバーストンネル要求）
    pub fn create_source(&mut self, request: &PortForwardSourceRequest) -> PortForwardSourceResponse {
        match PortForwardSourceListener::new(
            self.socket_handler.clone(),
            request.source_port,
            request.destination_port,
        ) {
            Ok(listener) => {
                self.source_listeners.push(listener);
                PortForwardSourceResponse::default()
            }
            Err(e) => {
                warn!(source_port = request.source_port, error = %e, "could not create tunnel source");
                PortForwardSourceResponse {
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// 宛先に接続し、新しい socket id を割り当てる
    pub fn create_destination(&mut self, request: &PortForwardDestinationRequest) -> PortForwardDestinationResponse {
        let mut response = PortForwardDestinationResponse {
            client_fd: request.fd,
            ..Default::default()
        };

        let fd = match self.connect_destination(request.port) {
            Ok(fd) => fd,
            Err(e) => {
                response.error = Some(e.to_string());
                return response;
            }
        };

        match self.allocate_socket_id() {
            Ok(socket_id) => {
                info!(socket_id, fd, port = request.port, "created socket/fd pair");
                self.destination_handlers.insert(
                    socket_id,
                    PortForwardDestinationHandler::new(self.socket_handler.clone(), fd, socket_id),
                );
                response.socket_id = Some(socket_id);
            }
            Err(e) => {
                error!(port = request.port, error = %e, "no socket id available");
                self.socket_handler.close(fd);
                response.error = Some(e.to_string());
            }
        }
        response
    }

    fn connect_destination(&self, port: i32) -> std::io::Result<Fd> {
        let port = u16::try_from(port).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid port number {port}"))
        })?;
        let mut last_error = None;
        for host in DESTINATION_HOSTS {
            match self.socket_handler.connect(&SocketEndpoint::new(host, port)) {
                Ok(fd) => return Ok(fd),
                Err(e) => {
                    debug!(host, port, error = %e, "destination connect failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::ConnectionRefused)))
    }

    fn allocate_socket_id(&mut self) -> Result<i32> {
        for _ in 0..self.max_socket_id_attempts {
            let candidate = (self.rng.next_u32() >> 1) as i32;
            if !self.destination_handlers.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ForwardError::SocketIdsExhausted)
    }

    /// ポートフォワード用パケットを 1 つ処理する
    ///
    /// 相手に返すべき応答があれば返す。
    ///
    /// # エラー
    /// - `ForwardError::Proto`: ペイロードを解釈できない
    /// - `ForwardError::ReverseTunnelFailed`: 相手がリバーストンネルを開けなかった
    /// - `ForwardError::UnexpectedPacket`: ポートフォワード以外のパケット
    pub fn handle_packet(&mut self, packet: &Packet) -> Result<Option<Packet>> {
        let kind = packet
            .packet_type()
            .ok_or(ForwardError::UnexpectedPacket(packet.header()))?;

        match kind {
            PacketType::PortForwardData => {
                let data: PortForwardData = decode_from_bytes(packet.payload())?;
                self.handle_data(data);
                Ok(None)
            }
            PacketType::PortForwardSourceRequest => {
                let request: PortForwardSourceRequest = decode_from_bytes(packet.payload())?;
                info!(
                    source_port = request.source_port,
                    destination_port = request.destination_port,
                    "got port source request"
                );
                let response = self.create_source(&request);
                Ok(Some(to_packet(PacketType::PortForwardSourceResponse, &response)))
            }
            PacketType::PortForwardSourceResponse => {
                let response: PortForwardSourceResponse = decode_from_bytes(packet.payload())?;
                match response.error {
                    Some(error) => Err(ForwardError::ReverseTunnelFailed(error)),
                    None => Ok(None),
                }
            }
            PacketType::PortForwardDestinationRequest => {
                let request: PortForwardDestinationRequest = decode_from_bytes(packet.payload())?;
                info!(port = request.port, "got port destination request");
                let response = self.create_destination(&request);
                Ok(Some(to_packet(PacketType::PortForwardDestinationResponse, &response)))
            }
            PacketType::PortForwardDestinationResponse => {
                let response: PortForwardDestinationResponse = decode_from_bytes(packet.payload())?;
                match (response.socket_id, response.error) {
                    (Some(socket_id), None) => self.add_source_socket_id(socket_id, response.client_fd),
                    (_, error) => {
                        info!(
                            fd = response.client_fd,
                            error = error.as_deref().unwrap_or("no socket id"),
                            "could not connect through tunnel"
                        );
                        self.close_source_fd(response.client_fd);
                    }
                }
                Ok(None)
            }
            other => Err(ForwardError::UnexpectedPacket(other.into())),
        }
    }

    fn handle_data(&mut self, data: PortForwardData) {
        let socket_id = data.socket_id;
        if !data.source_to_destination {
            if data.closed.is_some() {
                info!(socket_id, "port forward socket closed");
                self.close_source_socket_id(socket_id);
            } else if let Some(error) = data.error {
                info!(socket_id, %error, "port forward socket errored");
                self.close_source_socket_id(socket_id);
            } else {
                self.send_data_to_source_on_socket(socket_id, data.buffer.as_deref().unwrap_or_default());
            }
            return;
        }

        let Some(handler) = self.destination_handlers.get_mut(&socket_id) else {
            error!(socket_id, "got data for a socket id that has already closed");
            return;
        };
        if data.closed.is_some() || data.error.is_some() {
            info!(socket_id, error = ?data.error, "port forward socket closed by source");
            handler.close();
            self.destination_handlers.remove(&socket_id);
        } else {
            handler.write(data.buffer.as_deref().unwrap_or_default());
        }
    }

    pub fn close_source_fd(&mut self, fd: Fd) {
        match self.source_listeners.iter_mut().find(|l| l.has_unassigned_fd(fd)) {
            Some(listener) => listener.close_unassigned_fd(fd),
            None => error!(fd, "tried to close an unassigned socket that doesn't exist"),
        }
    }

    pub fn add_source_socket_id(&mut self, socket_id: i32, fd: Fd) {
        match self.source_listeners.iter().position(|l| l.has_unassigned_fd(fd)) {
            Some(index) => {
                self.source_listeners[index].add_socket(socket_id, fd);
                self.source_socket_ids.insert(socket_id, index);
            }
            None => error!(socket_id, fd, "tried to add a socket id but the source fd is already dead"),
        }
    }

    pub fn close_source_socket_id(&mut self, socket_id: i32) {
        match self.source_socket_ids.remove(&socket_id) {
            Some(index) => {
                if let Some(listener) = self.source_listeners.get_mut(index) {
                    listener.close_socket(socket_id);
                }
            }
            None => error!(socket_id, "tried to close a socket id that doesn't exist"),
        }
    }

    pub fn send_data_to_source_on_socket(&mut self, socket_id: i32, data: &[u8]) {
        let listener = self
            .source_socket_ids
            .get(&socket_id)
            .and_then(|index| self.source_listeners.get_mut(*index));
        match listener {
            Some(listener) => listener.send_data_on_socket(socket_id, data),
            None => error!(socket_id, "tried to send data on a socket id that doesn't exist"),
        }
    }

    /// `update` 1 回分をパケットにする
    pub fn poll_packets(&mut self) -> Vec<Packet> {
        let mut requests = Vec::new();
        let mut data = Vec::new();
        self.update(&mut requests, &mut data);

        let mut packets = Vec::with_capacity(requests.len() + data.len());
        packets.extend(
            requests
                .iter()
                .map(|request| to_packet(PacketType::PortForwardDestinationRequest, request)),
        );
        packets.extend(data.iter().map(|item| to_packet(PacketType::PortForwardData, item)));
        packets
    }

    /// 送信待ちに積む（`handle_packet` の応答など）
    pub fn enqueue(&mut self, packet: Packet) {
        self.outbox.push_back(packet);
    }

    /// ローカルソケットを 1 回更新し、送信待ちを `connection` に書く
    ///
    /// 切断中はローカルソケットを読まずに送信待ちを保持する。書けたパケット数を返す。
    pub fn pump(&mut self, connection: &mut Connection) -> usize {
        if !connection.is_connected() {
            return 0;
        }
        let packets = self.poll_packets();
        self.outbox.extend(packets);

        let mut sent = 0;
        while let Some(packet) = self.outbox.front() {
            if !connection.write(packet) {
                debug!(pending = self.outbox.len(), "connection not accepting, keeping packets");
                break;
            }
            self.outbox.pop_front();
            sent += 1;
        }
        sent
    }

    pub fn pending_packets(&self) -> usize {
        self.outbox.len()
    }

    pub fn destination_count(&self) -> usize {
        self.destination_handlers.len()
    }

    pub fn source_listener_count(&self) -> usize {
        self.source_listeners.len()
    }

    /// すべてのリスナーと宛先を閉じる
    pub fn shutdown(&mut self) {
        self.destination_handlers.clear();
        self.source_socket_ids.clear();
        self.source_listeners.clear();
        self.outbox.clear();
    }
}

fn to_packet<M: Message>(kind: PacketType, message: &M) -> Packet {
    Packet::typed(kind, encode_to_bytes(message))
}
