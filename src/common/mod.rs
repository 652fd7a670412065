pub mod addr;
pub mod error;
pub mod picker;
pub mod singleflight;
pub mod stream;
pub mod traffic;
pub mod udp;

pub use addr::Address;
pub use error::RouteError;
pub use stream::ProxyStream;
pub use traffic::TrafficStats;
pub use udp::{BoxUdpTransport, UdpPacket, UdpTransport};
