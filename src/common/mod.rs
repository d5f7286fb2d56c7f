pub mod addr;
pub mod error;
pub mod http;
pub mod latch;
pub mod pause;
pub mod stream;
pub mod udp;

pub use addr::Address;
pub use error::Error;
pub use latch::ReadyLatch;
pub use pause::PauseManager;
pub use stream::ProxyStream;
pub use udp::{BoxUdpTransport, UdpPacket, UdpTransport};
