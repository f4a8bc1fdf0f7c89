use std::time::Duration;

use serde::Serialize;

use crate::spyglass::probe::{
    bedrock::BedrockPong, dns::SrvTarget, legacy::LegacyStatus, modern::ModernStatus,
    query::QueryStatus,
};
use crate::spyglass::text::FormattedText;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SrvRecord {
    pub host: String,
    pub port: u16,
}

impl From<SrvTarget> for SrvRecord {
    fn from(srv: SrvTarget) -> Self {
        Self {
            host: srv.host,
            port: srv.port,
        }
    }
}

/// Everything the per-edition probes brought back for one request. Exactly one
/// canonical document shape is derived from it, whatever subset answered.
#[derive(Debug, Default)]
pub struct ProbeOutcome {
    pub modern: Option<ModernStatus>,
    pub legacy: Option<LegacyStatus>,
    pub query: Option<QueryStatus>,
}

#[derive(Debug, Serialize)]
pub struct JavaStatusDocument {
    pub online: bool,
    pub host: String,
    pub port: u16,
    pub ip_address: Option<String>,
    pub eula_blocked: bool,
    pub retrieved_at: i64,
    pub expires_at: i64,
    pub srv_record: Option<SrvRecord>,
    #[serde(flatten)]
    pub payload: Option<JavaPayload>,
}

#[derive(Debug, Serialize)]
pub struct JavaPayload {
    pub version: Option<JavaVersion>,
    pub players: JavaPlayers,
    pub motd: FormattedText,
    pub icon: Option<String>,
    pub mods: Vec<ModItem>,
    pub software: Option<String>,
    pub plugins: Vec<PluginItem>,
}

#[derive(Debug, Serialize)]
pub struct JavaVersion {
    pub name_raw: String,
    pub name_clean: String,
    pub name_html: String,
    pub protocol: i64,
}

#[derive(Debug, Serialize)]
pub struct JavaPlayers {
    pub online: Option<i64>,
    pub max: Option<i64>,
    pub list: Vec<PlayerEntry>,
}

#[derive(Debug, Serialize)]
pub struct PlayerEntry {
    pub uuid: String,
    pub name_raw: String,
    pub name_clean: String,
    pub name_html: String,
}

#[derive(Debug, Serialize)]
pub struct ModItem {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct PluginItem {
    pub name: String,
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BedrockStatusDocument {
    pub online: bool,
    pub host: String,
    pub port: u16,
    pub ip_address: Option<String>,
    pub eula_blocked: bool,
    pub retrieved_at: i64,
    pub expires_at: i64,
    pub srv_record: Option<SrvRecord>,
    #[serde(flatten)]
    pub payload: Option<BedrockPayload>,
}

#[derive(Debug, Serialize)]
pub struct BedrockPayload {
    pub version: Option<BedrockVersion>,
    pub players: Option<BedrockPlayers>,
    pub motd: Option<FormattedText>,
    pub gamemode: Option<String>,
    pub server_id: Option<String>,
    pub edition: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BedrockVersion {
    pub name: Option<String>,
    pub protocol: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BedrockPlayers {
    pub online: Option<i64>,
    pub max: Option<i64>,
}

fn version_from(name: &str, protocol: i64) -> JavaVersion {
    let text = FormattedText::parse(name);
    JavaVersion {
        name_raw: text.raw,
        name_clean: text.clean,
        name_html: text.html,
        protocol,
    }
}

fn player_from(uuid: &str, name: &str) -> PlayerEntry {
    let text = FormattedText::parse(name);
    PlayerEntry {
        uuid: uuid.to_string(),
        name_raw: text.raw,
        name_clean: text.clean,
        name_html: text.html,
    }
}

/// `"<software>: <name> <version>; <name>; …"` as reported by the UDP query.
/// A field without the `:` separator carries nothing usable and is skipped.
fn parse_plugins(field: &str) -> (Option<String>, Vec<PluginItem>) {
    let Some((software, rest)) = field.split_once(':') else {
        return (None, Vec::new());
    };

    let mut plugins = Vec::new();
    for item in rest.split(';') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let mut parts = item.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default().to_string();
        let version = parts
            .next()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        plugins.push(PluginItem { name, version });
    }

    let software = software.trim();
    (
        (!software.is_empty()).then(|| software.to_string()),
        plugins,
    )
}

/// Merge the Java probe results into the canonical document.
///
/// Precedence is modern, then legacy, then query; the query's extras (player
/// names, plugins) are grafted on top of whichever primary answered. Missing
/// pieces stay null — this function has no failure path.
#[allow(clippy::too_many_arguments)]
pub fn normalize_java(
    host: &str,
    port: u16,
    outcome: ProbeOutcome,
    srv_record: Option<SrvRecord>,
    ip_address: Option<String>,
    eula_blocked: bool,
    now_ms: i64,
    ttl: Duration,
) -> JavaStatusDocument {
    let online =
        outcome.modern.is_some() || outcome.legacy.is_some() || outcome.query.is_some();

    JavaStatusDocument {
        online,
        host: host.to_string(),
        port,
        ip_address,
        eula_blocked,
        retrieved_at: now_ms,
        expires_at: now_ms + ttl.as_millis() as i64,
        srv_record,
        payload: online.then(|| java_payload(&outcome)),
    }
}

fn java_payload(outcome: &ProbeOutcome) -> JavaPayload {
    let modern = outcome.modern.as_ref();
    let legacy = outcome.legacy.as_ref();
    let query = outcome.query.as_ref();

    let version = modern
        .and_then(|m| m.version.as_ref())
        .map(|v| version_from(&v.name, v.protocol))
        .or_else(|| {
            legacy.and_then(|l| {
                l.version
                    .as_ref()
                    .map(|name| version_from(name, l.protocol.unwrap_or(0)))
            })
        })
        .or_else(|| {
            query.and_then(|q| q.data.get("version").map(|name| version_from(name, 0)))
        });

    let online = modern
        .and_then(|m| m.players_online)
        .or_else(|| legacy.and_then(|l| l.online))
        .or_else(|| query.and_then(|q| q.data.get("numplayers")?.parse().ok()));
    let max = modern
        .and_then(|m| m.players_max)
        .or_else(|| legacy.and_then(|l| l.max))
        .or_else(|| query.and_then(|q| q.data.get("maxplayers")?.parse().ok()));

    let mut list: Vec<PlayerEntry> = modern
        .map(|m| {
            m.sample
                .iter()
                .map(|s| player_from(&s.id, &s.name))
                .collect()
        })
        .unwrap_or_default();
    if let Some(q) = query {
        for name in &q.players {
            if !list.iter().any(|p| &p.name_raw == name) {
                list.push(player_from("", name));
            }
        }
    }

    let motd = modern
        .map(|m| FormattedText::parse(&m.description))
        .or_else(|| legacy.map(|l| FormattedText::parse(&l.motd)))
        .or_else(|| {
            query.and_then(|q| q.data.get("hostname").map(|m| FormattedText::parse(m)))
        })
        .unwrap_or_else(|| FormattedText::parse(""));

    let (software, plugins) = query
        .and_then(|q| q.data.get("plugins"))
        .map(|field| parse_plugins(field))
        .unwrap_or((None, Vec::new()));

    JavaPayload {
        version,
        players: JavaPlayers { online, max, list },
        motd,
        icon: modern.and_then(|m| m.favicon.clone()),
        mods: modern
            .map(|m| {
                m.mods
                    .iter()
                    .map(|e| ModItem {
                        name: e.id.clone(),
                        version: e.version.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        software,
        plugins,
    }
}

/// Bedrock has a single probe; the document is the pong reshaped, or the bare
/// envelope when nothing answered.
pub fn normalize_bedrock(
    host: &str,
    port: u16,
    pong: Option<BedrockPong>,
    ip_address: Option<String>,
    eula_blocked: bool,
    now_ms: i64,
    ttl: Duration,
) -> BedrockStatusDocument {
    let payload = pong.map(|pong| BedrockPayload {
        version: (pong.version.is_some() || pong.protocol.is_some()).then(|| BedrockVersion {
            name: pong.version.clone(),
            protocol: pong.protocol,
        }),
        players: (pong.online.is_some() || pong.max.is_some()).then(|| BedrockPlayers {
            online: pong.online,
            max: pong.max,
        }),
        motd: pong.motd.as_deref().map(FormattedText::parse),
        gamemode: pong.gamemode,
        server_id: pong.server_id,
        edition: pong.edition,
    });

    BedrockStatusDocument {
        online: payload.is_some(),
        host: host.to_string(),
        port,
        ip_address,
        eula_blocked,
        retrieved_at: now_ms,
        expires_at: now_ms + ttl.as_millis() as i64,
        srv_record: None,
        payload,
    }
}
