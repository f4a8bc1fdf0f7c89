use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time,
};

const KICK_PACKET_ID: u8 = 0xFF;
const PING_HOST_CHANNEL: &str = "MC|PingHost";

/// Reply to the pre-1.7 0xFE ping. Only the `§1` form carries a protocol and
/// version; the beta form is MOTD and player counts alone.
#[derive(Debug, Clone, Default)]
pub struct LegacyStatus {
    pub protocol: Option<i64>,
    pub version: Option<String>,
    pub motd: String,
    pub online: Option<i64>,
    pub max: Option<i64>,
}

/// Legacy (1.6 and earlier) status ping: 0xFE 0x01 plus the 0xFA plugin
/// message, answered by a 0xFF kick whose UTF-16BE payload encodes the status.
pub async fn java_status_legacy(
    host: &str,
    port: u16,
    deadline: Duration,
    protocol_version: u8,
) -> Option<LegacyStatus> {
    match time::timeout(deadline, fetch(host, port, protocol_version)).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            tracing::debug!(host, port, err = %err, "probe: legacy status failed");
            None
        }
        Err(_) => {
            tracing::debug!(host, port, "probe: legacy status timed out");
            None
        }
    }
}

async fn fetch(host: &str, port: u16, protocol_version: u8) -> std::io::Result<LegacyStatus> {
    let mut conn = TcpStream::connect((host, port)).await?;

    let mut ping = vec![0xFE, 0x01, 0xFA];
    write_utf16_string(&mut ping, PING_HOST_CHANNEL);

    let host_units: Vec<u16> = host.encode_utf16().collect();
    ping.extend_from_slice(&((7 + 2 * host_units.len()) as u16).to_be_bytes());
    ping.push(protocol_version);
    write_utf16_string(&mut ping, host);
    ping.extend_from_slice(&(port as u32).to_be_bytes());

    conn.write_all(&ping).await?;

    let packet_id = conn.read_u8().await?;
    if packet_id != KICK_PACKET_ID {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected packet id: {packet_id:#04x}"),
        ));
    }

    let units = conn.read_u16().await? as usize;
    let mut buf = vec![0u8; units * 2];
    conn.read_exact(&mut buf).await?;

    let text: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    Ok(parse_kick(&String::from_utf16_lossy(&text)))
}

fn write_utf16_string(out: &mut Vec<u8>, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    out.extend_from_slice(&(units.len() as u16).to_be_bytes());
    for u in units {
        out.extend_from_slice(&u.to_be_bytes());
    }
}

fn parse_kick(text: &str) -> LegacyStatus {
    if let Some(rest) = text.strip_prefix("\u{a7}1\0") {
        // 1.4+: §1, protocol, version, motd, online, max — null-delimited.
        let fields: Vec<&str> = rest.split('\0').collect();
        return LegacyStatus {
            protocol: fields.first().and_then(|f| f.parse().ok()),
            version: fields.get(1).map(|f| f.to_string()),
            motd: fields.get(2).map(|f| f.to_string()).unwrap_or_default(),
            online: fields.get(3).and_then(|f| f.parse().ok()),
            max: fields.get(4).and_then(|f| f.parse().ok()),
        };
    }

    // Beta form: MOTD§online§max. The MOTD itself cannot contain § here.
    let fields: Vec<&str> = text.split('\u{a7}').collect();
    LegacyStatus {
        protocol: None,
        version: None,
        motd: fields.first().map(|f| f.to_string()).unwrap_or_default(),
        online: fields.get(1).and_then(|f| f.parse().ok()),
        max: fields.get(2).and_then(|f| f.parse().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parse_kick_post_14_form() {
        let s = parse_kick("\u{a7}1\047\01.4.2\0A Minecraft Server\04\020");
        assert_eq!(s.protocol, Some(47));
        assert_eq!(s.version.as_deref(), Some("1.4.2"));
        assert_eq!(s.motd, "A Minecraft Server");
        assert_eq!(s.online, Some(4));
        assert_eq!(s.max, Some(20));
    }

    #[test]
    fn parse_kick_beta_form() {
        let s = parse_kick("A Minecraft Server\u{a7}2\u{a7}10");
        assert_eq!(s.protocol, None);
        assert_eq!(s.version, None);
        assert_eq!(s.motd, "A Minecraft Server");
        assert_eq!(s.online, Some(2));
        assert_eq!(s.max, Some(10));
    }

    #[test]
    fn parse_kick_garbage_yields_motd_only() {
        let s = parse_kick("nonsense");
        assert_eq!(s.motd, "nonsense");
        assert_eq!(s.online, None);
    }

    #[tokio::test]
    async fn ping_conversation_against_fixture_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();

            let mut head = [0u8; 3];
            conn.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [0xFE, 0x01, 0xFA]);

            // Drain the rest of the ping before answering.
            let mut rest = vec![0u8; 256];
            let _ = conn.read(&mut rest).await.unwrap();

            let reply = "\u{a7}1\047\01.4.2\0hello\01\05";
            let units: Vec<u16> = reply.encode_utf16().collect();
            let mut out = vec![KICK_PACKET_ID];
            out.extend_from_slice(&(units.len() as u16).to_be_bytes());
            for u in units {
                out.extend_from_slice(&u.to_be_bytes());
            }
            conn.write_all(&out).await.unwrap();
        });

        let status = java_status_legacy("127.0.0.1", addr.port(), Duration::from_secs(2), 47)
            .await
            .expect("status");
        assert_eq!(status.protocol, Some(47));
        assert_eq!(status.motd, "hello");
        assert_eq!(status.online, Some(1));
        assert_eq!(status.max, Some(5));
    }
}
