use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time,
};

use crate::spyglass::text::color_code_for_name;

const HANDSHAKE_PACKET_ID: i32 = 0x00;
const STATUS_REQUEST_PACKET_ID: i32 = 0x00;
const STATUS_NEXT_STATE: i32 = 1;

// Status payloads are small; anything bigger than this is a misbehaving peer.
const MAX_PACKET_BYTES: i32 = 1 << 21;

#[derive(Debug, Error)]
enum WireError {
    #[error("varint too long")]
    VarIntTooLong,
    #[error("negative length")]
    NegativeLength,
    #[error("truncated packet")]
    Truncated,
    #[error("packet too large: {0}")]
    PacketTooLarge(i32),
    #[error("unexpected packet id: {0}")]
    UnexpectedPacket(i32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parsed Status-Response, kept close to the wire. Text fields stay raw
/// (`§`-escaped); the normalizer derives the formatted renderings.
#[derive(Debug, Clone, Default)]
pub struct ModernStatus {
    pub version: Option<ModernVersion>,
    pub players_online: Option<i64>,
    pub players_max: Option<i64>,
    pub sample: Vec<SamplePlayer>,
    pub description: String,
    pub favicon: Option<String>,
    pub mods: Vec<ModEntry>,
}

#[derive(Debug, Clone)]
pub struct ModernVersion {
    pub name: String,
    pub protocol: i64,
}

#[derive(Debug, Clone)]
pub struct SamplePlayer {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ModEntry {
    pub id: String,
    pub version: String,
}

/// Modern (1.7+) status conversation: handshake, status request, JSON reply.
///
/// One attempt; any failure inside the deadline reads as "no reply".
pub async fn java_status(
    host: &str,
    port: u16,
    deadline: Duration,
    protocol_version: i32,
) -> Option<ModernStatus> {
    match time::timeout(deadline, fetch(host, port, protocol_version)).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            tracing::debug!(host, port, err = %err, "probe: modern status failed");
            None
        }
        Err(_) => {
            tracing::debug!(host, port, "probe: modern status timed out");
            None
        }
    }
}

async fn fetch(host: &str, port: u16, protocol_version: i32) -> Result<ModernStatus, WireError> {
    let mut conn = TcpStream::connect((host, port)).await?;

    let mut handshake = Vec::with_capacity(host.len() + 16);
    write_varint_buf(&mut handshake, HANDSHAKE_PACKET_ID);
    write_varint_buf(&mut handshake, protocol_version);
    write_varint_buf(&mut handshake, host.len() as i32);
    handshake.extend_from_slice(host.as_bytes());
    handshake.extend_from_slice(&port.to_be_bytes());
    write_varint_buf(&mut handshake, STATUS_NEXT_STATE);
    write_packet(&mut conn, &handshake).await?;

    let mut request = Vec::new();
    write_varint_buf(&mut request, STATUS_REQUEST_PACKET_ID);
    write_packet(&mut conn, &request).await?;

    let payload = read_packet(&mut conn).await?;
    let mut cursor = payload.as_slice();

    let packet_id = read_varint(&mut cursor).await?;
    if packet_id != STATUS_REQUEST_PACKET_ID {
        return Err(WireError::UnexpectedPacket(packet_id));
    }

    let json_len = read_varint(&mut cursor).await?;
    if json_len < 0 {
        return Err(WireError::NegativeLength);
    }
    let json = cursor
        .get(..json_len as usize)
        .ok_or(WireError::Truncated)?;

    parse_status(json)
}

fn parse_status(json: &[u8]) -> Result<ModernStatus, WireError> {
    #[derive(Deserialize)]
    struct RawStatus {
        version: Option<RawVersion>,
        players: Option<RawPlayers>,
        #[serde(default)]
        description: Value,
        favicon: Option<String>,
        #[serde(default)]
        modinfo: Option<RawModInfo>,
    }

    #[derive(Deserialize)]
    struct RawVersion {
        #[serde(default)]
        name: String,
        #[serde(default)]
        protocol: i64,
    }

    #[derive(Deserialize)]
    struct RawPlayers {
        online: Option<i64>,
        max: Option<i64>,
        #[serde(default)]
        sample: Vec<RawSample>,
    }

    #[derive(Deserialize)]
    struct RawSample {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
    }

    #[derive(Deserialize)]
    struct RawModInfo {
        #[serde(default, rename = "modList")]
        mod_list: Vec<RawMod>,
    }

    #[derive(Deserialize)]
    struct RawMod {
        #[serde(default)]
        modid: String,
        #[serde(default)]
        version: String,
    }

    let raw: RawStatus = serde_json::from_slice(json)?;

    let mut description = String::new();
    flatten_chat(&raw.description, &mut description);

    Ok(ModernStatus {
        version: raw.version.map(|v| ModernVersion {
            name: v.name,
            protocol: v.protocol,
        }),
        players_online: raw.players.as_ref().and_then(|p| p.online),
        players_max: raw.players.as_ref().and_then(|p| p.max),
        sample: raw
            .players
            .map(|p| {
                p.sample
                    .into_iter()
                    .map(|s| SamplePlayer {
                        id: s.id,
                        name: s.name,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        description,
        favicon: raw.favicon,
        mods: raw
            .modinfo
            .map(|m| {
                m.mod_list
                    .into_iter()
                    .map(|m| ModEntry {
                        id: m.modid,
                        version: m.version,
                    })
                    .collect()
            })
            .unwrap_or_default(),
    })
}

/// Collapse a chat component tree back into a `§`-escaped string.
fn flatten_chat(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            for item in items {
                flatten_chat(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(color) = map.get("color").and_then(Value::as_str) {
                out.push('\u{a7}');
                out.push(color_code_for_name(color));
            }
            for (key, code) in [
                ("bold", 'l'),
                ("italic", 'o'),
                ("underlined", 'n'),
                ("strikethrough", 'm'),
                ("obfuscated", 'k'),
            ] {
                if map.get(key).and_then(Value::as_bool).unwrap_or(false) {
                    out.push('\u{a7}');
                    out.push(code);
                }
            }
            if let Some(text) = map.get("text").and_then(Value::as_str) {
                out.push_str(text);
            }
            if let Some(extra) = map.get("extra") {
                flatten_chat(extra, out);
            }
        }
        _ => {}
    }
}

async fn write_packet<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<(), WireError> {
    let mut framed = Vec::with_capacity(data.len() + 5);
    write_varint_buf(&mut framed, data.len() as i32);
    framed.extend_from_slice(data);
    w.write_all(&framed).await?;
    Ok(())
}

async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, WireError> {
    let len = read_varint(r).await?;
    if len < 0 {
        return Err(WireError::NegativeLength);
    }
    if len > MAX_PACKET_BYTES {
        return Err(WireError::PacketTooLarge(len));
    }

    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

fn write_varint_buf(out: &mut Vec<u8>, mut v: i32) {
    loop {
        let mut temp = (v & 0x7f) as u8;
        v = ((v as u32) >> 7) as i32;
        if v != 0 {
            temp |= 0x80;
        }
        out.push(temp);
        if v == 0 {
            break;
        }
    }
}

async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<i32, WireError> {
    let mut num_read = 0;
    let mut result: i32 = 0;
    loop {
        if num_read >= 5 {
            return Err(WireError::VarIntTooLong);
        }

        let read = r.read_u8().await?;
        let value = (read & 0x7F) as i32;
        result |= value << (7 * num_read);

        num_read += 1;

        if (read & 0x80) == 0 {
            break;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn varint(v: i32) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint_buf(&mut out, v);
        out
    }

    #[tokio::test]
    async fn varint_roundtrip() {
        for v in [0, 1, 127, 128, 255, 25565, i32::MAX] {
            let buf = varint(v);
            let got = read_varint(&mut buf.as_slice()).await.unwrap();
            assert_eq!(got, v);
        }
    }

    #[tokio::test]
    async fn varint_rejects_overlong_encoding() {
        let buf = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01];
        let err = read_varint(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, WireError::VarIntTooLong));
    }

    #[tokio::test]
    async fn packet_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let payload = b"status payload".to_vec();

        let sent = payload.clone();
        let w = tokio::spawn(async move { write_packet(&mut a, &sent).await });
        let got = read_packet(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn oversized_packet_is_rejected_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut hdr = Vec::new();
            write_varint_buf(&mut hdr, MAX_PACKET_BYTES + 1);
            let _ = a.write_all(&hdr).await;
        });

        let err = read_packet(&mut b).await.unwrap_err();
        assert!(matches!(err, WireError::PacketTooLarge(_)));
    }

    #[test]
    fn parse_status_plain_description() {
        let json = br#"{
            "version": {"name": "1.20.4", "protocol": 765},
            "players": {"online": 3, "max": 20, "sample": [{"id": "u1", "name": "a"}]},
            "description": "hi",
            "favicon": "data:image/png;base64,AAAA"
        }"#;
        let s = parse_status(json).unwrap();
        let v = s.version.unwrap();
        assert_eq!(v.name, "1.20.4");
        assert_eq!(v.protocol, 765);
        assert_eq!(s.players_online, Some(3));
        assert_eq!(s.players_max, Some(20));
        assert_eq!(s.sample.len(), 1);
        assert_eq!(s.sample[0].name, "a");
        assert_eq!(s.description, "hi");
        assert_eq!(s.favicon.as_deref(), Some("data:image/png;base64,AAAA"));
    }

    #[test]
    fn parse_status_chat_object_description() {
        let json = br#"{
            "description": {
                "text": "Welcome ",
                "extra": [{"color": "gold", "bold": true, "text": "friends"}]
            }
        }"#;
        let s = parse_status(json).unwrap();
        assert_eq!(s.description, "Welcome \u{a7}6\u{a7}lfriends");
        assert!(s.version.is_none());
    }

    #[test]
    fn parse_status_forge_mod_list() {
        let json = br#"{
            "description": "",
            "modinfo": {"type": "FML", "modList": [{"modid": "thermal", "version": "10.3"}]}
        }"#;
        let s = parse_status(json).unwrap();
        assert_eq!(s.mods.len(), 1);
        assert_eq!(s.mods[0].id, "thermal");
        assert_eq!(s.mods[0].version, "10.3");
    }

    #[tokio::test]
    async fn status_conversation_against_fixture_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();

            // Handshake then status request.
            let handshake = read_packet(&mut conn).await.unwrap();
            let mut cur = handshake.as_slice();
            assert_eq!(read_varint(&mut cur).await.unwrap(), 0);
            assert_eq!(read_varint(&mut cur).await.unwrap(), 47);
            let request = read_packet(&mut conn).await.unwrap();
            assert_eq!(request, varint(0));

            let body = br#"{"version":{"name":"1.8.9","protocol":47},"players":{"online":1,"max":10},"description":"fixture"}"#;
            let mut payload = Vec::new();
            write_varint_buf(&mut payload, 0);
            write_varint_buf(&mut payload, body.len() as i32);
            payload.extend_from_slice(body);
            write_packet(&mut conn, &payload).await.unwrap();
        });

        let status = java_status("127.0.0.1", addr.port(), Duration::from_secs(2), 47)
            .await
            .expect("status");
        assert_eq!(status.version.unwrap().name, "1.8.9");
        assert_eq!(status.players_online, Some(1));
        assert_eq!(status.description, "fixture");
    }

    #[tokio::test]
    async fn unreachable_port_reads_as_no_reply() {
        // Port 1 on loopback is almost certainly closed; connect fails fast.
        let got = java_status("127.0.0.1", 1, Duration::from_millis(500), 47).await;
        assert!(got.is_none());
    }
}
