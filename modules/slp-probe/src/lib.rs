//! Server List Ping probing: handshake + status request over TCP, response
//! collection, and status JSON extraction.

pub mod varint;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use varint::{read_varint, write_varint};

/// Responses are truncated past this size; a status payload with a favicon
/// stays well under it.
const MAX_RESPONSE_BYTES: usize = 512 * 1024;

/// Handshake framing on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Handshake body without an outer length prefix. Nonstandard, but most
    /// servers reply to it anyway.
    #[default]
    Legacy,
    /// Body preceded by its VarInt length, per the protocol.
    Framed,
}

/// Status request packet: length prefix 1, packet id 0x00.
pub const STATUS_REQUEST: [u8; 2] = [0x01, 0x00];

/// Handshake packet for `hostname`/`port` with next state = Status.
pub fn handshake_packet(hostname: &str, port: u16, framing: Framing) -> Vec<u8> {
    let mut body = Vec::with_capacity(7 + hostname.len());
    body.push(0x00); // packet id
    write_varint(&mut body, 0); // protocol version
    write_varint(&mut body, hostname.len() as i32);
    body.extend_from_slice(hostname.as_bytes());
    body.extend_from_slice(&port.to_be_bytes());
    body.push(0x01); // next state: Status
    match framing {
        Framing::Legacy => body,
        Framing::Framed => {
            let mut framed = Vec::with_capacity(body.len() + 1);
            write_varint(&mut framed, body.len() as i32);
            framed.extend_from_slice(&body);
            framed
        }
    }
}

/// Fields pulled out of a status response, plus the payload kept verbatim.
#[derive(Debug, Clone)]
pub struct RawStatus {
    pub version_name: Option<String>,
    pub protocol: Option<i64>,
    pub players_online: i64,
    pub players_max: i64,
    pub player_sample: Vec<String>,
    pub description: serde_json::Value,
    pub has_favicon: bool,
    pub raw: String,
}

impl RawStatus {
    fn from_json(value: serde_json::Value, raw: String) -> Self {
        let version = value.get("version");
        let players = value.get("players");
        let player_sample = players
            .and_then(|p| p.get("sample"))
            .and_then(|s| s.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|e| e.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        RawStatus {
            version_name: version
                .and_then(|v| v.get("name"))
                .and_then(|n| n.as_str())
                .map(str::to_string),
            protocol: version.and_then(|v| v.get("protocol")).and_then(|p| p.as_i64()),
            players_online: players
                .and_then(|p| p.get("online"))
                .and_then(|o| o.as_i64())
                .unwrap_or(0),
            players_max: players
                .and_then(|p| p.get("max"))
                .and_then(|m| m.as_i64())
                .unwrap_or(0),
            player_sample,
            description: value.get("description").cloned().unwrap_or(serde_json::Value::Null),
            has_favicon: value.get("favicon").is_some(),
            raw,
        }
    }
}

/// How a single probe attempt ended.
#[derive(Debug)]
pub enum Outcome {
    /// Connect failed, reset, or timed out with no usable bytes.
    NoResponse,
    /// Bytes arrived but no status JSON could be located in them.
    Malformed,
    Server(RawStatus),
}

impl Outcome {
    pub fn is_server(&self) -> bool {
        matches!(self, Outcome::Server(_))
    }
}

#[derive(Debug)]
pub struct ProbeResult {
    pub outcome: Outcome,
    pub elapsed_ms: u64,
}

/// Extract the status JSON from a response buffer: framed parse first, then
/// the first-`{`-to-last-`}` fallback.
pub fn parse_response(buf: &[u8]) -> Outcome {
    if buf.is_empty() {
        return Outcome::NoResponse;
    }
    if let Some(status) = parse_framed(buf) {
        return Outcome::Server(status);
    }
    if let Some(status) = parse_fallback(buf) {
        return Outcome::Server(status);
    }
    Outcome::Malformed
}

fn parse_framed(buf: &[u8]) -> Option<RawStatus> {
    let mut r = buf;
    let _packet_len = read_varint(&mut r).ok()?;
    let _packet_id = read_varint(&mut r).ok()?;
    let json_len = usize::try_from(read_varint(&mut r).ok()?).ok()?;
    if r.len() < json_len {
        return None;
    }
    let raw = std::str::from_utf8(&r[..json_len]).ok()?;
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    if !value.is_object() {
        return None;
    }
    Some(RawStatus::from_json(value, raw.to_string()))
}

fn parse_fallback(buf: &[u8]) -> Option<RawStatus> {
    let text = String::from_utf8_lossy(buf);
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let raw = &text[start..=end];
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    if !value.is_object() {
        return None;
    }
    Some(RawStatus::from_json(value, raw.to_string()))
}

/// Connect to `ip:port`, send the handshake + status request, and collect
/// the reply until close or the deadline. One shot; the socket is released
/// on every exit path.
pub async fn probe(ip: Ipv4Addr, port: u16, deadline: Duration, framing: Framing) -> ProbeResult {
    let started = Instant::now();
    let outcome = match read_status_bytes(ip, port, deadline, framing, started).await {
        Some(bytes) => parse_response(&bytes),
        None => Outcome::NoResponse,
    };
    ProbeResult { outcome, elapsed_ms: started.elapsed().as_millis() as u64 }
}

async fn read_status_bytes(
    ip: Ipv4Addr,
    port: u16,
    deadline: Duration,
    framing: Framing,
    started: Instant,
) -> Option<Vec<u8>> {
    let addr = SocketAddr::from((ip, port));
    let mut stream = timeout(deadline, TcpStream::connect(addr)).await.ok()?.ok()?;

    let mut request = handshake_packet(&ip.to_string(), port, framing);
    request.extend_from_slice(&STATUS_REQUEST);
    let remaining = deadline.checked_sub(started.elapsed())?;
    timeout(remaining, stream.write_all(&request)).await.ok()?.ok()?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
            break;
        };
        match timeout(remaining, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() >= MAX_RESPONSE_BYTES {
                    break;
                }
            }
            // Reset or deadline: parse whatever arrived.
            Ok(Err(_)) | Err(_) => break,
        }
    }
    Some(buf)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    const STATUS_JSON: &str = r#"{"version":{"name":"1.20.4","protocol":765},"players":{"online":25,"max":100},"description":{"text":"Welcome"}}"#;

    fn framed_status(json: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.push(0x00);
        write_varint(&mut payload, json.len() as i32);
        payload.extend_from_slice(json.as_bytes());
        let mut frame = Vec::new();
        write_varint(&mut frame, payload.len() as i32);
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn legacy_handshake_bytes_are_exact() {
        let pkt = handshake_packet("1.2.3.4", 25565, Framing::Legacy);
        let mut expect = vec![0x00, 0x00, 0x07];
        expect.extend_from_slice(b"1.2.3.4");
        expect.extend_from_slice(&[0x63, 0xdd, 0x01]);
        assert_eq!(pkt, expect);
    }

    #[test]
    fn framed_handshake_adds_one_length_byte() {
        let host = "203.0.113.254";
        let pkt = handshake_packet(host, 25565, Framing::Framed);
        assert_eq!(pkt.len(), 7 + host.len());
        assert_eq!(pkt[0] as usize, 6 + host.len());
        // Port octets sit just before the state byte.
        assert_eq!(pkt[pkt.len() - 3], (25565u16 >> 8) as u8);
        assert_eq!(pkt[pkt.len() - 2], (25565u16 & 0xff) as u8);
        assert_eq!(pkt[pkt.len() - 1], 0x01);
    }

    #[test]
    fn framed_response_parses_strictly() {
        let frame = framed_status(STATUS_JSON);
        match parse_response(&frame) {
            Outcome::Server(status) => {
                assert_eq!(status.version_name.as_deref(), Some("1.20.4"));
                assert_eq!(status.protocol, Some(765));
                assert_eq!(status.players_online, 25);
                assert_eq!(status.players_max, 100);
                assert_eq!(status.raw, STATUS_JSON);
            }
            other => panic!("expected Server, got {other:?}"),
        }
    }

    #[test]
    fn unframed_response_parses_via_fallback() {
        let bytes = b"\x00\x00\x00garbage{\"players\":{\"online\":0,\"max\":10}}trailing";
        match parse_response(bytes) {
            Outcome::Server(status) => {
                assert_eq!(status.players_online, 0);
                assert_eq!(status.players_max, 10);
                assert!(status.version_name.is_none());
            }
            other => panic!("expected Server, got {other:?}"),
        }
    }

    #[test]
    fn empty_buffer_is_no_response() {
        assert!(matches!(parse_response(&[]), Outcome::NoResponse));
    }

    #[test]
    fn braceless_bytes_are_malformed() {
        assert!(matches!(parse_response(b"\x01\x02nonsense"), Outcome::Malformed));
        assert!(matches!(parse_response(b"}{"), Outcome::Malformed));
    }

    async fn fake_server(reply: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut scratch = [0u8; 256];
                let _ = stream.read(&mut scratch).await;
                let _ = stream.write_all(&reply).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn probe_reads_a_framed_status() {
        let addr = fake_server(framed_status(STATUS_JSON)).await;
        let result = probe(
            "127.0.0.1".parse().unwrap(),
            addr.port(),
            Duration::from_millis(2500),
            Framing::Legacy,
        )
        .await;
        match result.outcome {
            Outcome::Server(status) => {
                assert_eq!(status.version_name.as_deref(), Some("1.20.4"));
                assert_eq!(status.players_online, 25);
            }
            other => panic!("expected Server, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_with_strict_framing_also_succeeds() {
        let addr = fake_server(framed_status(STATUS_JSON)).await;
        let result = probe(
            "127.0.0.1".parse().unwrap(),
            addr.port(),
            Duration::from_millis(2500),
            Framing::Framed,
        )
        .await;
        assert!(result.outcome.is_server());
    }

    #[tokio::test]
    async fn probe_against_closed_port_is_no_response() {
        // Bind then drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = probe(
            "127.0.0.1".parse().unwrap(),
            addr.port(),
            Duration::from_millis(500),
            Framing::Legacy,
        )
        .await;
        assert!(matches!(result.outcome, Outcome::NoResponse));
    }
}
