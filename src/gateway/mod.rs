//! 订阅网关
//!
//! WebSocket 订阅协议、连接循环，以及历史查询和运维接口的 HTTP 路由。

pub mod connection;
pub mod protocol;
pub mod router;

pub use connection::{ConnectionSession, handle_socket};
pub use protocol::{ClientCommand, ServerEvent, StatusPayload, parse_command};
pub use router::{GatewayState, build_router};
