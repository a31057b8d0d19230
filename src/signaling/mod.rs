//! Signaling over WebSocket: typed wire messages, the relay state machine that routes them and
//! guards admission, and the actix actors that drive it.
pub mod actor;
pub mod message;
pub mod relay;
pub mod session;

pub use actor::RelayActor;
pub use relay::SignalingRelay;
pub use session::WebSocketSession;
