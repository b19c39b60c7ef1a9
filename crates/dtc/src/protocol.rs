//! Binary DTC-style wire format.
//!
//! Every frame is a 4-byte little-endian header `{u16 size, u16 type}`
//! followed by `size - 4` payload bytes. Payloads are packed with no
//! padding; strings are fixed-width and null-padded.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DtcError;

pub const HEADER_LEN: usize = 4;
pub const PROTOCOL_VERSION: u16 = 8;

/// `LogonResponse::result` value for a successful logon.
pub const LOGON_SUCCESS: u16 = 1;
/// `SubscriptionResponse::result` value for an accepted subscription.
pub const SUBSCRIPTION_ACCEPTED: u16 = 0;

pub const USERNAME_LEN: usize = 32;
pub const PASSWORD_LEN: usize = 32;
pub const CLIENT_NAME_LEN: usize = 32;
pub const TEXT_LEN: usize = 64;
pub const SYMBOL_LEN: usize = 64;
pub const EXCHANGE_LEN: usize = 32;

/// Message type codes used by this client.
pub mod message_type {
    pub const LOGON_REQUEST: u16 = 1;
    pub const LOGON_RESPONSE: u16 = 2;
    pub const HEARTBEAT: u16 = 3;
    pub const LOGOFF: u16 = 5;
    pub const MARKET_DATA_SUBSCRIBE: u16 = 101;
    pub const MARKET_DATA_SUBSCRIPTION_RESPONSE: u16 = 102;
    pub const MARKET_DATA_UPDATE_TRADE: u16 = 107;
}

// ---------------------------------------------------------------------------
// Fixed-width strings
// ---------------------------------------------------------------------------

/// Append `value` as a null-padded field of exactly `width` bytes.
/// Longer values are truncated to fit.
pub fn put_fixed_str(buf: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    buf.extend_from_slice(&bytes[..n]);
    buf.resize(buf.len() + (width - n), 0);
}

/// Read a null-padded field. Everything from the first NUL on is ignored.
pub fn fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
    message_type: u16,
}

impl<'a> PayloadReader<'a> {
    fn new(message_type: u16, buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            message_type,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DtcError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DtcError::Malformed(format!(
                "message type {} payload too short: need {} bytes, have {}",
                self.message_type,
                end,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, DtcError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DtcError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64, DtcError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }

    fn str(&mut self, width: usize) -> Result<String, DtcError> {
        self.take(width).map(fixed_str)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LogonRequest {
    pub protocol_version: u16,
    pub username: String,
    pub password: String,
    pub heartbeat_interval_secs: u16,
    pub client_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogonResponse {
    pub protocol_version: u16,
    pub result: u16,
    pub result_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub num_dropped_messages: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Logoff {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketDataSubscribe {
    pub request_id: u32,
    pub symbol: String,
    pub exchange: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionResponse {
    pub request_id: u32,
    pub result: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeUpdate {
    pub request_id: u32,
    pub symbol: String,
    pub exchange: String,
    pub price: f64,
    pub size: f64,
    /// Seconds since the Unix epoch, fractional.
    pub timestamp: f64,
}

/// Every message this client sends or understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    LogonRequest(LogonRequest),
    LogonResponse(LogonResponse),
    Heartbeat(Heartbeat),
    Logoff(Logoff),
    MarketDataSubscribe(MarketDataSubscribe),
    SubscriptionResponse(SubscriptionResponse),
    TradeUpdate(TradeUpdate),
}

impl Message {
    pub fn message_type(&self) -> u16 {
        use message_type::*;
        match self {
            Message::LogonRequest(_) => LOGON_REQUEST,
            Message::LogonResponse(_) => LOGON_RESPONSE,
            Message::Heartbeat(_) => HEARTBEAT,
            Message::Logoff(_) => LOGOFF,
            Message::MarketDataSubscribe(_) => MARKET_DATA_SUBSCRIBE,
            Message::SubscriptionResponse(_) => MARKET_DATA_SUBSCRIPTION_RESPONSE,
            Message::TradeUpdate(_) => MARKET_DATA_UPDATE_TRADE,
        }
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Message::LogonRequest(m) => {
                buf.extend_from_slice(&m.protocol_version.to_le_bytes());
                put_fixed_str(buf, &m.username, USERNAME_LEN);
                put_fixed_str(buf, &m.password, PASSWORD_LEN);
                buf.extend_from_slice(&m.heartbeat_interval_secs.to_le_bytes());
                put_fixed_str(buf, &m.client_name, CLIENT_NAME_LEN);
            }
            Message::LogonResponse(m) => {
                buf.extend_from_slice(&m.protocol_version.to_le_bytes());
                buf.extend_from_slice(&m.result.to_le_bytes());
                put_fixed_str(buf, &m.result_text, TEXT_LEN);
            }
            Message::Heartbeat(m) => {
                buf.extend_from_slice(&m.num_dropped_messages.to_le_bytes());
            }
            Message::Logoff(m) => {
                put_fixed_str(buf, &m.reason, TEXT_LEN);
            }
            Message::MarketDataSubscribe(m) => {
                buf.extend_from_slice(&m.request_id.to_le_bytes());
                put_fixed_str(buf, &m.symbol, SYMBOL_LEN);
                put_fixed_str(buf, &m.exchange, EXCHANGE_LEN);
            }
            Message::SubscriptionResponse(m) => {
                buf.extend_from_slice(&m.request_id.to_le_bytes());
                buf.extend_from_slice(&m.result.to_le_bytes());
                put_fixed_str(buf, &m.reason, TEXT_LEN);
            }
            Message::TradeUpdate(m) => {
                buf.extend_from_slice(&m.request_id.to_le_bytes());
                put_fixed_str(buf, &m.symbol, SYMBOL_LEN);
                put_fixed_str(buf, &m.exchange, EXCHANGE_LEN);
                buf.extend_from_slice(&m.price.to_le_bytes());
                buf.extend_from_slice(&m.size.to_le_bytes());
                buf.extend_from_slice(&m.timestamp.to_le_bytes());
            }
        }
    }

    /// Encode a complete frame, header included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&[0u8; HEADER_LEN]);
        self.encode_payload(&mut buf);

        // Payloads are fixed-width and far below u16::MAX.
        let size = buf.len() as u16;
        buf[0..2].copy_from_slice(&size.to_le_bytes());
        buf[2..4].copy_from_slice(&self.message_type().to_le_bytes());
        buf
    }

    /// Decode the payload of a frame. Trailing bytes beyond the known
    /// layout are ignored.
    pub fn decode(frame: &Frame) -> Result<Message, DtcError> {
        use message_type::*;
        let mut r = PayloadReader::new(frame.message_type, &frame.payload);
        let msg = match frame.message_type {
            LOGON_REQUEST => Message::LogonRequest(LogonRequest {
                protocol_version: r.u16()?,
                username: r.str(USERNAME_LEN)?,
                password: r.str(PASSWORD_LEN)?,
                heartbeat_interval_secs: r.u16()?,
                client_name: r.str(CLIENT_NAME_LEN)?,
            }),
            LOGON_RESPONSE => Message::LogonResponse(LogonResponse {
                protocol_version: r.u16()?,
                result: r.u16()?,
                result_text: r.str(TEXT_LEN)?,
            }),
            HEARTBEAT => Message::Heartbeat(Heartbeat {
                num_dropped_messages: r.u32()?,
            }),
            LOGOFF => Message::Logoff(Logoff {
                reason: r.str(TEXT_LEN)?,
            }),
            MARKET_DATA_SUBSCRIBE => Message::MarketDataSubscribe(MarketDataSubscribe {
                request_id: r.u32()?,
                symbol: r.str(SYMBOL_LEN)?,
                exchange: r.str(EXCHANGE_LEN)?,
            }),
            MARKET_DATA_SUBSCRIPTION_RESPONSE => {
                Message::SubscriptionResponse(SubscriptionResponse {
                    request_id: r.u32()?,
                    result: r.u16()?,
                    reason: r.str(TEXT_LEN)?,
                })
            }
            MARKET_DATA_UPDATE_TRADE => Message::TradeUpdate(TradeUpdate {
                request_id: r.u32()?,
                symbol: r.str(SYMBOL_LEN)?,
                exchange: r.str(EXCHANGE_LEN)?,
                price: r.f64()?,
                size: r.f64()?,
                timestamp: r.f64()?,
            }),
            other => return Err(DtcError::UnexpectedMessage(other)),
        };
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// One raw frame as read off the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u16,
    pub payload: Vec<u8>,
}

/// Read a single frame. A short read surfaces as an `UnexpectedEof` IO error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, DtcError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let size = u16::from_le_bytes([header[0], header[1]]) as usize;
    let message_type = u16::from_le_bytes([header[2], header[3]]);
    if size < HEADER_LEN {
        return Err(DtcError::Malformed(format!(
            "frame size {} smaller than header",
            size
        )));
    }

    let mut payload = vec![0u8; size - HEADER_LEN];
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        message_type,
        payload,
    })
}

/// Encode and write a message, flushing afterwards.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), DtcError> {
    writer.write_all(&msg.encode()).await?;
    writer.flush().await?;
    Ok(())
}
