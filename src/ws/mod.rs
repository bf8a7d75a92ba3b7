// Exchange WebSocket streams: closed candles from the business channel,
// order and algo-order pushes from the private channel
pub mod messages;
pub mod stream;

pub use messages::{parse_business, parse_private, PrivateEvent, WsEvent};
pub use stream::{spawn_candle_stream, spawn_private_stream};
