//! # et-forward
//!
//! 1 本の `Connection` 上でのポートフォワード多重化。
//!
//! ## 構成
//!
//! ```text
//! PortForwardRouter
//!   ├── PortForwardSourceListener  ローカルで待ち受け、接続ごとに socket id を得る
//!   └── PortForwardDestinationHandler  相手の要求で宛先に接続したソケット
//! ```
//!
//! すべてのデータは `PortForwardData{socket_id, source_to_destination, ...}` として
//! 種別付きパケットに載り、socket id で振り分けられる。未知の id は
//! ログに残して捨てる。
//!
//! ## 使い方
//!
//! `handle_packet` のエラーはそのパケット 1 つ分の失敗で、セッションは続く。
//! ログに残して次のパケットへ進む（リバーストンネルを開けなかった場合も同じ）。
//!
//! ```text
//! loop {
//!     while let Some(packet) = connection.read()? {
//!         if !packet.packet_type().is_some_and(PacketType::is_port_forward) {
//!             continue;
//!         }
//!         match router.handle_packet(&packet) {
//!             Ok(Some(reply)) => router.enqueue(reply),
//!             Ok(None) => {}
//!             Err(ForwardError::ReverseTunnelFailed(reason)) => {
//!                 warn!(%reason, "reverse tunnel was not opened");
//!             }
//!             Err(e) => warn!(error = %e, "dropping port forward packet"),
//!         }
//!     }
//!     router.pump(&mut connection);
//! }
//! ```

pub mod destination_handler;
pub mod error;
mod forwarded;
pub mod router;
pub mod source_listener;
pub mod write_buffer;

pub use destination_handler::PortForwardDestinationHandler;
pub use error::{ForwardError, Result};
pub use router::{PortForwardRouter, MAX_SOCKET_ID_ATTEMPTS};
pub use source_listener::{PortForwardSourceListener, SOURCE_LISTEN_HOST};
pub use write_buffer::{WriteBuffer, WRITE_BUFFER_LIMIT};
