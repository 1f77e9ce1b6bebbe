//! # et-transport
//!
//! ソケット抽象・パケットフレーミング・再送可能な送受信。
//!
//! ## ソケット上のデータパケット
//!
//! ```text
//! [length: u32 BE][encrypted: u8][header: u8][counter: u64 BE][ciphertext + tag]
//!                                            ↑ AES-256-OCB3 (header は追加認証データ)
//! ```
//!
//! ## 送受信の流れ
//!
//! ```text
//! BackedWriter.write(packet)
//!   → 暗号化（counter 割り当て = シーケンス番号 - 1）
//!   → バックログに記録
//!   → ソケットへ書き込み（失敗してもバックログに残る）
//!
//! BackedReader.read()
//!   → 再接続時の再送分（ローカルバッファ）を優先
//!   → フレーム読み出し → 番号検査 → 復号
//! ```

pub mod backed_reader;
pub mod backed_writer;
pub mod error;
pub mod memory;
pub mod packet;
pub mod socket;
pub mod tcp;

pub use backed_reader::{BackedReader, DEFAULT_MAX_FRAME_BYTES};
pub use backed_writer::{BackedWriter, WriteOutcome, DEFAULT_MAX_BACKLOG_BYTES};
pub use error::TransportError;
pub use memory::InMemorySocketHandler;
pub use packet::{Packet, FRAME_HEADER_LEN};
pub use socket::{is_retryable, Fd, SocketEndpoint, SocketHandler, SocketHandlerExt, DEFAULT_IO_TIMEOUT};
pub use tcp::TcpSocketHandler;
