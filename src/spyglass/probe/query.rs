use std::{collections::HashMap, io, time::Duration};

use tokio::{net::UdpSocket, time};

const QUERY_MAGIC: [u8; 2] = [0xFE, 0xFD];
const PACKET_TYPE_HANDSHAKE: u8 = 0x09;
const PACKET_TYPE_STAT: u8 = 0x00;
const SESSION_ID: u32 = 0x0001_0101;

// Constant filler the server sends between the session id and the first key.
const STAT_PADDING_LEN: usize = 11;
// "\x01player_\0\0" separates the key/value section from the player list.
const PLAYER_HEADER_LEN: usize = 10;

/// Full-stat reply: free-form key/value data plus the online player names.
#[derive(Debug, Clone, Default)]
pub struct QueryStatus {
    pub data: HashMap<String, String>,
    pub players: Vec<String>,
}

/// GameSpy-derived UDP query: challenge handshake, then a full stat.
/// The server only answers when `enable-query` is set on its side.
pub async fn full_query(host: &str, port: u16, deadline: Duration) -> Option<QueryStatus> {
    match time::timeout(deadline, fetch(host, port)).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            tracing::debug!(host, port, err = %err, "probe: full query failed");
            None
        }
        Err(_) => {
            tracing::debug!(host, port, "probe: full query timed out");
            None
        }
    }
}

async fn fetch(host: &str, port: u16) -> io::Result<QueryStatus> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, port)).await?;

    let mut handshake = Vec::with_capacity(7);
    handshake.extend_from_slice(&QUERY_MAGIC);
    handshake.push(PACKET_TYPE_HANDSHAKE);
    handshake.extend_from_slice(&SESSION_ID.to_be_bytes());
    socket.send(&handshake).await?;

    let mut buf = vec![0u8; 1 << 16];
    let n = socket.recv(&mut buf).await?;
    let challenge = parse_challenge(&buf[..n])?;

    let mut stat = Vec::with_capacity(15);
    stat.extend_from_slice(&QUERY_MAGIC);
    stat.push(PACKET_TYPE_STAT);
    stat.extend_from_slice(&SESSION_ID.to_be_bytes());
    stat.extend_from_slice(&challenge.to_be_bytes());
    // Four zero bytes upgrade the request from basic to full stat.
    stat.extend_from_slice(&[0, 0, 0, 0]);
    socket.send(&stat).await?;

    let n = socket.recv(&mut buf).await?;
    parse_full_stat(&buf[..n])
}

fn bad_reply(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("query: {what}"))
}

fn parse_challenge(pkt: &[u8]) -> io::Result<i32> {
    if pkt.len() < 5 || pkt[0] != PACKET_TYPE_HANDSHAKE {
        return Err(bad_reply("malformed challenge reply"));
    }

    let (token, _) = read_cstr(&pkt[5..]).ok_or_else(|| bad_reply("unterminated challenge"))?;
    token
        .parse()
        .map_err(|_| bad_reply("non-numeric challenge"))
}

fn parse_full_stat(pkt: &[u8]) -> io::Result<QueryStatus> {
    if pkt.len() < 5 + STAT_PADDING_LEN || pkt[0] != PACKET_TYPE_STAT {
        return Err(bad_reply("malformed stat reply"));
    }

    let mut rest = &pkt[5 + STAT_PADDING_LEN..];
    let mut data = HashMap::new();

    loop {
        let (key, tail) = read_cstr(rest).ok_or_else(|| bad_reply("unterminated key"))?;
        rest = tail;
        if key.is_empty() {
            break;
        }
        let (value, tail) = read_cstr(rest).ok_or_else(|| bad_reply("unterminated value"))?;
        rest = tail;
        data.insert(key, value);
    }

    let mut players = Vec::new();
    if rest.len() > PLAYER_HEADER_LEN {
        rest = &rest[PLAYER_HEADER_LEN..];
        while let Some((name, tail)) = read_cstr(rest) {
            rest = tail;
            if name.is_empty() {
                break;
            }
            players.push(name);
        }
    }

    Ok(QueryStatus { data, players })
}

fn read_cstr(buf: &[u8]) -> Option<(String, &[u8])> {
    let nul = buf.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&buf[..nul]).into_owned();
    Some((s, &buf[nul + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_reply(kv: &[(&str, &str)], players: &[&str]) -> Vec<u8> {
        let mut out = vec![PACKET_TYPE_STAT];
        out.extend_from_slice(&SESSION_ID.to_be_bytes());
        out.extend_from_slice(b"splitnum\x00\x80\x00");
        for (k, v) in kv {
            out.extend_from_slice(k.as_bytes());
            out.push(0);
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        out.push(0);
        out.extend_from_slice(b"\x01player_\x00\x00");
        for p in players {
            out.extend_from_slice(p.as_bytes());
            out.push(0);
        }
        out.push(0);
        out
    }

    #[test]
    fn parse_challenge_reply() {
        let mut pkt = vec![PACKET_TYPE_HANDSHAKE];
        pkt.extend_from_slice(&SESSION_ID.to_be_bytes());
        pkt.extend_from_slice(b"9513307\x00");
        assert_eq!(parse_challenge(&pkt).unwrap(), 9513307);
    }

    #[test]
    fn parse_full_stat_sections() {
        let pkt = stat_reply(
            &[
                ("hostname", "A Minecraft Server"),
                ("numplayers", "2"),
                ("maxplayers", "20"),
                ("plugins", "Paper: Essentials 2.19; WorldEdit"),
            ],
            &["alice", "bob"],
        );
        let s = parse_full_stat(&pkt).unwrap();
        assert_eq!(s.data.get("hostname").unwrap(), "A Minecraft Server");
        assert_eq!(s.data.get("numplayers").unwrap(), "2");
        assert_eq!(s.players, vec!["alice", "bob"]);
    }

    #[test]
    fn parse_full_stat_without_players() {
        let pkt = stat_reply(&[("hostname", "x")], &[]);
        let s = parse_full_stat(&pkt).unwrap();
        assert!(s.players.is_empty());
    }

    #[test]
    fn truncated_stat_is_an_error() {
        assert!(parse_full_stat(&[PACKET_TYPE_STAT, 0, 0]).is_err());
        let mut pkt = vec![PACKET_TYPE_STAT];
        pkt.extend_from_slice(&SESSION_ID.to_be_bytes());
        pkt.extend_from_slice(b"splitnum\x00\x80\x00key-without-nul");
        assert!(parse_full_stat(&pkt).is_err());
    }

    #[tokio::test]
    async fn query_conversation_against_fixture_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];

            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..3], &[0xFE, 0xFD, PACKET_TYPE_HANDSHAKE]);
            assert_eq!(n, 7);

            let mut challenge = vec![PACKET_TYPE_HANDSHAKE];
            challenge.extend_from_slice(&buf[3..7]);
            challenge.extend_from_slice(b"1337\x00");
            server.send_to(&challenge, peer).await.unwrap();

            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..3], &[0xFE, 0xFD, PACKET_TYPE_STAT]);
            assert_eq!(&buf[7..11], &1337i32.to_be_bytes());
            assert_eq!(n, 15);

            let reply = stat_reply(&[("hostname", "fixture"), ("numplayers", "1")], &["alice"]);
            server.send_to(&reply, peer).await.unwrap();
        });

        let s = full_query("127.0.0.1", addr.port(), Duration::from_secs(2))
            .await
            .expect("query");
        assert_eq!(s.data.get("hostname").unwrap(), "fixture");
        assert_eq!(s.players, vec!["alice"]);
    }
}
