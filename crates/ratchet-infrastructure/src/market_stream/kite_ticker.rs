use ratchet_domain::repositories::market_stream::StreamError;
use ratchet_domain::value_objects::tick::Tick;

pub const DEFAULT_TICKER_URL: &str = "wss://ws.kite.trade";

/// Every ticker packet mode (ltp 8, quote 44, full 184, index 28/32) starts
/// with the instrument token and last price as big-endian i32.
const MIN_PACKET_LEN: usize = 8;

/// Prices arrive as integers; the divisor depends on the exchange segment
/// carried in the low byte of the token.
fn price_divisor(instrument_token: u32) -> f64 {
    match instrument_token & 0xff {
        3 => 10_000_000.0, // CDS
        6 => 10_000.0,     // BCD
        _ => 100.0,
    }
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn read_i32(data: &[u8], at: usize) -> Option<i32> {
    data.get(at..at + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decodes one binary ticker frame. A one-byte frame is a heartbeat and
/// yields no ticks.
pub fn parse_binary_frame(frame: &[u8], observed_at: i64) -> Result<Vec<Tick>, StreamError> {
    if frame.len() < 2 {
        return Ok(Vec::new());
    }
    let count = read_u16(frame, 0)
        .ok_or_else(|| StreamError::Protocol("frame missing packet count".to_string()))?;
    let mut ticks = Vec::with_capacity(count as usize);
    let mut offset = 2;
    for idx in 0..count {
        let len = read_u16(frame, offset).ok_or_else(|| {
            StreamError::Protocol(format!("packet {idx} header truncated at byte {offset}"))
        })? as usize;
        offset += 2;
        let packet = frame.get(offset..offset + len).ok_or_else(|| {
            StreamError::Protocol(format!(
                "packet {idx} declares {len} bytes, {} remain",
                frame.len().saturating_sub(offset)
            ))
        })?;
        offset += len;
        if len < MIN_PACKET_LEN {
            continue;
        }
        let (Some(token), Some(raw_price)) = (read_i32(packet, 0), read_i32(packet, 4)) else {
            continue;
        };
        let token = token as u32;
        ticks.push(Tick::new(
            token,
            f64::from(raw_price) / price_divisor(token),
            observed_at,
        ));
    }
    Ok(ticks)
}

pub fn subscribe_messages(tokens: &[u32]) -> [String; 2] {
    [
        serde_json::json!({ "a": "subscribe", "v": tokens }).to_string(),
        serde_json::json!({ "a": "mode", "v": ["ltp", tokens] }).to_string(),
    ]
}

#[cfg(feature = "realtime-kite")]
pub use socket::KiteTickerStream;

#[cfg(feature = "realtime-kite")]
mod socket {
    use super::{parse_binary_frame, subscribe_messages};
    use ratchet_domain::repositories::market_stream::{StreamError, StreamEvent, TickStream};
    use tungstenite::protocol::Message;
    use url::Url;

    type Socket = tungstenite::WebSocket<tungstenite::stream::MaybeTlsStream<std::net::TcpStream>>;

    #[derive(Debug)]
    pub struct KiteTickerStream {
        socket: Socket,
    }

    impl KiteTickerStream {
        pub fn connect(
            base_url: &str,
            api_key: &str,
            access_token: &str,
            tokens: &[u32],
        ) -> Result<Self, String> {
            let mut url = Url::parse(base_url).map_err(|e| format!("invalid ticker URL: {e}"))?;
            url.query_pairs_mut()
                .append_pair("api_key", api_key)
                .append_pair("access_token", access_token);
            let (mut socket, _resp) =
                tungstenite::connect(url.as_str()).map_err(|e| format!("ws connect failed: {e}"))?;
            for message in subscribe_messages(tokens) {
                socket
                    .send(Message::Text(message))
                    .map_err(|e| format!("ws subscribe failed: {e}"))?;
            }
            tracing::info!(instruments = tokens.len(), "ticker subscribed");
            Ok(Self { socket })
        }
    }

    impl TickStream for KiteTickerStream {
        fn next_event(&mut self) -> Result<StreamEvent, StreamError> {
            loop {
                let msg = self
                    .socket
                    .read()
                    .map_err(|e| StreamError::Disconnected(e.to_string()))?;
                match msg {
                    Message::Binary(frame) => {
                        let observed_at = chrono::Utc::now().timestamp_millis();
                        let ticks = parse_binary_frame(&frame, observed_at)?;
                        if ticks.is_empty() {
                            return Ok(StreamEvent::Heartbeat);
                        }
                        return Ok(StreamEvent::Ticks(ticks));
                    }
                    Message::Text(text) => {
                        // Order updates and server errors; only errors matter here.
                        if text.contains("\"type\":\"error\"") {
                            tracing::warn!(message = %text, "ticker error message");
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = self.socket.send(Message::Pong(payload));
                    }
                    Message::Pong(_) | Message::Frame(_) => {}
                    Message::Close(_) => {
                        return Err(StreamError::Disconnected("server closed".to_string()));
                    }
                }
            }
        }

        fn close(&mut self) {
            let _ = self.socket.close(None);
        }
    }
}
