use std::{io, time::Duration};

use tokio::{net::UdpSocket, time};

const ID_UNCONNECTED_PING: u8 = 0x01;
const ID_UNCONNECTED_PONG: u8 = 0x1C;
const OFFLINE_MESSAGE_MAGIC: [u8; 16] = [
    0x00, 0xFF, 0xFF, 0x00, 0xFE, 0xFE, 0xFE, 0xFE, 0xFD, 0xFD, 0xFD, 0xFD, 0x12, 0x34, 0x56,
    0x78,
];
const CLIENT_GUID: u64 = 0x7C3A_91E4_0D26_55B8;

/// Fields of the `;`-delimited unconnected-pong payload. Servers routinely
/// omit the tail, so everything past the MOTD is optional.
#[derive(Debug, Clone, Default)]
pub struct BedrockPong {
    pub edition: Option<String>,
    pub motd: Option<String>,
    pub protocol: Option<i64>,
    pub version: Option<String>,
    pub online: Option<i64>,
    pub max: Option<i64>,
    pub server_id: Option<String>,
    pub gamemode: Option<String>,
    pub gamemode_id: Option<i64>,
    pub port_v4: Option<u16>,
    pub port_v6: Option<u16>,
}

/// Raknet unconnected ping, the Bedrock discovery conversation.
pub async fn bedrock_status(host: &str, port: u16, deadline: Duration) -> Option<BedrockPong> {
    match time::timeout(deadline, fetch(host, port)).await {
        Ok(Ok(pong)) => Some(pong),
        Ok(Err(err)) => {
            tracing::debug!(host, port, err = %err, "probe: bedrock status failed");
            None
        }
        Err(_) => {
            tracing::debug!(host, port, "probe: bedrock status timed out");
            None
        }
    }
}

async fn fetch(host: &str, port: u16) -> io::Result<BedrockPong> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, port)).await?;

    let mut ping = Vec::with_capacity(33);
    ping.push(ID_UNCONNECTED_PING);
    ping.extend_from_slice(&0u64.to_be_bytes()); // ping time
    ping.extend_from_slice(&OFFLINE_MESSAGE_MAGIC);
    ping.extend_from_slice(&CLIENT_GUID.to_be_bytes());
    socket.send(&ping).await?;

    let mut buf = vec![0u8; 1 << 16];
    let n = socket.recv(&mut buf).await?;
    parse_pong(&buf[..n])
}

fn bad_reply(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("bedrock: {what}"))
}

fn parse_pong(pkt: &[u8]) -> io::Result<BedrockPong> {
    // id + time + guid + magic + payload length prefix
    if pkt.len() < 1 + 8 + 8 + 16 + 2 || pkt[0] != ID_UNCONNECTED_PONG {
        return Err(bad_reply("malformed pong"));
    }
    if pkt[17..33] != OFFLINE_MESSAGE_MAGIC {
        return Err(bad_reply("bad offline-message magic"));
    }

    let len = u16::from_be_bytes([pkt[33], pkt[34]]) as usize;
    let payload = pkt
        .get(35..35 + len)
        .ok_or_else(|| bad_reply("truncated pong payload"))?;

    Ok(parse_payload(&String::from_utf8_lossy(payload)))
}

fn parse_payload(payload: &str) -> BedrockPong {
    let fields: Vec<&str> = payload.split(';').collect();
    let text = |i: usize| {
        fields
            .get(i)
            .map(|f| f.to_string())
            .filter(|f| !f.is_empty())
    };
    let num = |i: usize| fields.get(i).and_then(|f| f.parse::<i64>().ok());

    // MOTD spans two fields: the headline and the sub-line below it.
    let motd = match (text(1), text(7)) {
        (Some(line), Some(sub)) => Some(format!("{line}\n{sub}")),
        (Some(line), None) => Some(line),
        (None, sub) => sub,
    };

    BedrockPong {
        edition: text(0),
        motd,
        protocol: num(2),
        version: text(3),
        online: num(4),
        max: num(5),
        server_id: text(6),
        gamemode: text(8),
        gamemode_id: num(9),
        port_v4: fields.get(10).and_then(|f| f.parse().ok()),
        port_v6: fields.get(11).and_then(|f| f.parse().ok()),
    }
}
