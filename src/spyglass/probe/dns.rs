use anyhow::Context;
use hickory_resolver::TokioAsyncResolver;

/// SRV indirection target for a Java server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub host: String,
    pub port: u16,
}

/// Best-effort DNS lookups. Failures are ordinary (most servers have no SRV
/// record at all), so both operations answer with `None` rather than erroring.
pub struct Dns {
    resolver: TokioAsyncResolver,
}

impl Dns {
    pub fn new() -> anyhow::Result<Self> {
        let resolver =
            TokioAsyncResolver::tokio_from_system_conf().context("dns: init resolver")?;
        Ok(Self { resolver })
    }

    /// `_minecraft._tcp.<host>` SRV record, trailing dot stripped from the
    /// target.
    pub async fn lookup_srv(&self, host: &str) -> Option<SrvTarget> {
        let name = format!("_minecraft._tcp.{host}.");
        match self.resolver.srv_lookup(name).await {
            Ok(lookup) => lookup.iter().next().map(|srv| SrvTarget {
                host: srv
                    .target()
                    .to_string()
                    .trim_end_matches('.')
                    .to_string(),
                port: srv.port(),
            }),
            Err(err) => {
                tracing::debug!(host, err = %err, "dns: srv lookup failed");
                None
            }
        }
    }

    /// First A/AAAA answer for the probe target.
    pub async fn lookup_ip(&self, host: &str) -> Option<String> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().next().map(|ip| ip.to_string()),
            Err(err) => {
                tracing::debug!(host, err = %err, "dns: ip lookup failed");
                None
            }
        }
    }
}
