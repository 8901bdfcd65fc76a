pub mod client;
pub mod protocol;
pub mod sink;

pub use client::TransportClient;
pub use protocol::ServerMessage;
pub use sink::TransportSink;
