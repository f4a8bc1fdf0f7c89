use std::{collections::HashSet, sync::Arc, sync::OnceLock, time::Duration};

use arc_swap::ArcSwap;
use regex::Regex;
use tokio::sync::watch;

use crate::spyglass::hash::sha1_hex;

const BLOCKED_SERVERS_URL: &str = "https://sessionserver.mojang.com/blockedservers";
const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Membership test against Mojang's EULA blocklist.
pub trait Blocklist: Send + Sync {
    fn is_blocked(&self, host: &str) -> bool;
}

pub type SharedBlocklist = Arc<dyn Blocklist>;

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").expect("ipv4 regex"))
}

/// All patterns Mojang may have hashed for a host, most specific first.
///
/// IPv4 literals wildcard right-to-left (`a.b.c.*`, `a.b.*`, `a.*`); hostnames
/// wildcard left-to-right (`*.b.c.d`, `*.c.d`, `*.d`).
fn wildcard_variants(host: &str) -> Vec<String> {
    let host = host.to_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    let is_ip = ipv4_regex().is_match(&host);

    let mut out = Vec::with_capacity(labels.len());
    out.push(host.clone());

    for k in 1..labels.len() {
        if is_ip {
            out.push(format!("{}.*", labels[..labels.len() - k].join(".")));
        } else {
            out.push(format!("*.{}", labels[k..].join(".")));
        }
    }

    out
}

/// In-memory mirror of the published hash list.
///
/// The active set is swapped atomically; readers take one load and scan an
/// immutable snapshot, so a refresh never blocks a membership test.
pub struct MojangBlocklist {
    hashes: ArcSwap<HashSet<String>>,
    client: reqwest::Client,
}

impl MojangBlocklist {
    pub fn new() -> Self {
        Self {
            hashes: ArcSwap::from_pointee(HashSet::new()),
            client: reqwest::Client::new(),
        }
    }

    /// Fetch the list once and install it. The previous set stays live on any
    /// failure.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let resp = self.client.get(BLOCKED_SERVERS_URL).send().await?;

        if !resp.status().is_success() {
            anyhow::bail!("blocklist: unexpected status code: {}", resp.status());
        }

        let body = resp.text().await?;
        let set: HashSet<String> = body
            .lines()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .collect();

        tracing::info!(hashes = set.len(), "blocklist: installed");
        self.hashes.store(Arc::new(set));

        Ok(())
    }

    /// Hourly refresh loop; the next attempt is scheduled after the previous
    /// one completes, success or failure.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            if let Err(err) = self.refresh().await {
                tracing::warn!(err = %err, "blocklist: refresh failed, keeping previous set");
            }
        }
    }

    #[cfg(test)]
    fn install(&self, hashes: impl IntoIterator<Item = String>) {
        self.hashes.store(Arc::new(hashes.into_iter().collect()));
    }
}

impl Blocklist for MojangBlocklist {
    fn is_blocked(&self, host: &str) -> bool {
        let hashes = self.hashes.load();
        if hashes.is_empty() {
            return false;
        }

        wildcard_variants(host)
            .iter()
            .any(|v| hashes.contains(&sha1_hex(v.as_bytes())))
    }
}
