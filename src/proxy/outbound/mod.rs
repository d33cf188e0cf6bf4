pub mod direct;
pub mod http;
pub mod reject;
pub mod socks5;

pub use direct::DirectOutbound;
pub use http::HttpOutbound;
pub use reject::RejectOutbound;
pub use socks5::Socks5Outbound;
