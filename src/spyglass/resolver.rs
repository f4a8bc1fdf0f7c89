use std::{
    future::Future,
    net::IpAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tokio::{sync::watch, time};

use crate::spyglass::{
    blocklist::SharedBlocklist,
    config::Config,
    document::{self, ProbeOutcome, SrvRecord},
    hash::fingerprint,
    icon,
    probe::{bedrock, dns::Dns, legacy, modern, query},
    store::{MutexGuard, Store, StoreError},
};

pub const JAVA_DEFAULT_PORT: u16 = 25565;
pub const BEDROCK_DEFAULT_PORT: u16 = 19132;

// Pre-1.9 protocol number; old enough that servers answer it with their own
// version info instead of a "client outdated" error.
const STATUS_PROTOCOL_SPOOF: i32 = 47;

// Each probe gets slightly less than the request budget so there is room to
// merge and serialize before the caller's deadline.
const PROBE_HEADROOM: Duration = Duration::from_millis(100);

// How long the UDP query may keep running once both TCP probes have spoken.
const QUERY_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialize status document: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct StatusOptions {
    pub query: bool,
    pub timeout: Duration,
    pub bypass_cache: bool,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            query: true,
            timeout: Duration::from_secs(5),
            bypass_cache: false,
        }
    }
}

/// Everything a request handler needs, wired once at startup.
pub struct Service {
    pub config: Config,
    pub store: Option<Store>,
    pub blocklist: SharedBlocklist,
    dns: Arc<Dns>,
}

impl Service {
    pub fn new(
        config: Config,
        store: Option<Store>,
        blocklist: SharedBlocklist,
        dns: Arc<Dns>,
    ) -> Self {
        Self {
            config,
            store,
            blocklist,
            dns,
        }
    }

    /// Java status through the cache-and-lock pipeline. A cache hit returns the
    /// stored bytes with the remaining TTL; a fresh probe returns zero TTL.
    pub async fn resolve_java(
        &self,
        host: &str,
        port: u16,
        opts: &StatusOptions,
    ) -> Result<(Vec<u8>, Duration), ResolveError> {
        let fp = fingerprint(host, port, Some(opts.query));
        let cache_key = format!("java:{fp}");

        self.count_hit("java-hits", host, port).await;

        if let Some(store) = &self.store {
            if !opts.bypass_cache {
                if let Some((bytes, ttl)) = store.get(&cache_key).await? {
                    return Ok((bytes, ttl));
                }
            }
        }

        let guard = if opts.bypass_cache {
            None
        } else {
            self.lock(&format!("java-lock:{fp}")).await
        };
        if guard.is_some() {
            let store = self.store.as_ref().expect("lock implies store");
            // Another process may have filled the cache while we queued.
            match store.get(&cache_key).await {
                Ok(Some((bytes, ttl))) => {
                    self.unlock(guard).await;
                    return Ok((bytes, ttl));
                }
                Ok(None) => {}
                Err(err) => {
                    self.unlock(guard).await;
                    return Err(err.into());
                }
            }
        }

        let ttl = self.config.cache.java_status_duration;
        let (outcome, srv_record, ip_address) = self.probe_java(host, port, opts).await;
        let doc = document::normalize_java(
            host,
            port,
            outcome,
            srv_record,
            ip_address,
            self.blocklist.is_blocked(host),
            now_ms(),
            ttl,
        );

        let body = match serde_json::to_vec(&doc) {
            Ok(body) => body,
            Err(err) => {
                self.unlock(guard).await;
                return Err(err.into());
            }
        };

        self.cache_put(&cache_key, &body, ttl).await;
        self.unlock(guard).await;

        Ok((body, Duration::ZERO))
    }

    /// Bedrock status: a single raknet ping under the same cache-and-lock
    /// wrapper. The fingerprint has no query dimension.
    pub async fn resolve_bedrock(
        &self,
        host: &str,
        port: u16,
        opts: &StatusOptions,
    ) -> Result<(Vec<u8>, Duration), ResolveError> {
        let fp = fingerprint(host, port, None);
        let cache_key = format!("bedrock:{fp}");

        self.count_hit("bedrock-hits", host, port).await;

        if let Some(store) = &self.store {
            if !opts.bypass_cache {
                if let Some((bytes, ttl)) = store.get(&cache_key).await? {
                    return Ok((bytes, ttl));
                }
            }
        }

        let guard = if opts.bypass_cache {
            None
        } else {
            self.lock(&format!("bedrock-lock:{fp}")).await
        };
        if guard.is_some() {
            let store = self.store.as_ref().expect("lock implies store");
            match store.get(&cache_key).await {
                Ok(Some((bytes, ttl))) => {
                    self.unlock(guard).await;
                    return Ok((bytes, ttl));
                }
                Ok(None) => {}
                Err(err) => {
                    self.unlock(guard).await;
                    return Err(err.into());
                }
            }
        }

        let ttl = self.config.cache.bedrock_status_duration;
        let (pong, ip_address) = tokio::join!(
            bedrock::bedrock_status(host, port, opts.timeout),
            self.resolve_ip(host, opts.timeout),
        );
        let doc = document::normalize_bedrock(
            host,
            port,
            pong,
            ip_address,
            self.blocklist.is_blocked(host),
            now_ms(),
            ttl,
        );

        let body = match serde_json::to_vec(&doc) {
            Ok(body) => body,
            Err(err) => {
                self.unlock(guard).await;
                return Err(err.into());
            }
        };

        self.cache_put(&cache_key, &body, ttl).await;
        self.unlock(guard).await;

        Ok((body, Duration::ZERO))
    }

    /// Server icon bytes: separately cached, no locks. Servers without a
    /// favicon (or without a reply at all) get the embedded default.
    pub async fn resolve_icon(
        &self,
        host: &str,
        port: u16,
        opts: &StatusOptions,
    ) -> Result<(Vec<u8>, Duration), ResolveError> {
        let fp = fingerprint(host, port, None);
        let cache_key = format!("icon:{fp}");

        if let Some(store) = &self.store {
            if !opts.bypass_cache {
                if let Some((bytes, ttl)) = store.get(&cache_key).await? {
                    return Ok((bytes, ttl));
                }
            }
        }

        let (target_host, target_port, _) = self.resolve_target(host, port, opts.timeout).await;
        let status = modern::java_status(
            &target_host,
            target_port,
            opts.timeout,
            STATUS_PROTOCOL_SPOOF,
        )
        .await;
        let bytes = icon::icon_bytes(status.as_ref().and_then(|s| s.favicon.as_deref()));

        self.cache_put(&cache_key, &bytes, self.config.cache.icon_duration)
            .await;

        Ok((bytes, Duration::ZERO))
    }

    /// Concurrent Java fan-out: modern, legacy and (optionally) query race
    /// under one budget. Modern completing cancels legacy outright; the query
    /// gets a short grace tail once both TCP probes are done, because a silent
    /// UDP port would otherwise pin the request to the full timeout.
    async fn probe_java(
        &self,
        host: &str,
        port: u16,
        opts: &StatusOptions,
    ) -> (ProbeOutcome, Option<SrvRecord>, Option<String>) {
        let budget = opts
            .timeout
            .saturating_sub(PROBE_HEADROOM)
            .max(PROBE_HEADROOM);

        let (target_host, target_port, srv_record) = self.resolve_target(host, port, budget).await;

        let (cancel_l_tx, cancel_l_rx) = watch::channel(false);
        let (cancel_q_tx, cancel_q_rx) = watch::channel(false);

        let mut m_task = {
            let host = target_host.clone();
            tokio::spawn(async move {
                modern::java_status(&host, target_port, budget, STATUS_PROTOCOL_SPOOF).await
            })
        };
        let mut l_task = {
            let host = target_host.clone();
            tokio::spawn(cancellable(
                async move {
                    legacy::java_status_legacy(
                        &host,
                        target_port,
                        budget,
                        STATUS_PROTOCOL_SPOOF as u8,
                    )
                    .await
                },
                cancel_l_rx,
            ))
        };
        let mut q_task = if opts.query {
            let host = target_host.clone();
            tokio::spawn(cancellable(
                async move { query::full_query(&host, target_port, budget).await },
                cancel_q_rx,
            ))
        } else {
            tokio::spawn(async { None::<query::QueryStatus> })
        };

        let ip_task = {
            let dns = self.dns.clone();
            let host = target_host.clone();
            tokio::spawn(async move { lookup_ip_bounded(&dns, &host, budget).await })
        };

        let mut outcome = ProbeOutcome::default();
        let mut m_pending = true;
        let mut l_pending = true;
        let mut q_pending = opts.query;

        let grace = time::sleep(Duration::from_secs(3600));
        tokio::pin!(grace);
        let mut grace_armed = false;

        while m_pending || l_pending || q_pending {
            tokio::select! {
                res = &mut m_task, if m_pending => {
                    m_pending = false;
                    outcome.modern = res.unwrap_or_default();
                    // Once modern has spoken the legacy ping is redundant.
                    let _ = cancel_l_tx.send(true);
                }
                res = &mut l_task, if l_pending => {
                    l_pending = false;
                    outcome.legacy = res.unwrap_or_default();
                }
                res = &mut q_task, if q_pending => {
                    q_pending = false;
                    outcome.query = res.unwrap_or_default();
                }
                _ = grace.as_mut(), if grace_armed && q_pending => {
                    grace_armed = false;
                    let _ = cancel_q_tx.send(true);
                }
            }

            if !m_pending && !l_pending && q_pending && !grace_armed {
                grace.as_mut().reset(time::Instant::now() + QUERY_GRACE);
                grace_armed = true;
            }
        }

        let ip_address = ip_task.await.unwrap_or_default();

        (outcome, srv_record, ip_address)
    }

    /// SRV indirection for Java probes. IP literals never have SRV records and
    /// already are their own address, so DNS is skipped entirely for them.
    async fn resolve_target(
        &self,
        host: &str,
        port: u16,
        budget: Duration,
    ) -> (String, u16, Option<SrvRecord>) {
        if host.parse::<IpAddr>().is_ok() {
            return (host.to_string(), port, None);
        }

        let srv = time::timeout(budget, self.dns.lookup_srv(host))
            .await
            .ok()
            .flatten();

        match srv {
            Some(target) => {
                let record = SrvRecord::from(target);
                (record.host.clone(), record.port, Some(record))
            }
            None => (host.to_string(), port, None),
        }
    }

    async fn resolve_ip(&self, host: &str, budget: Duration) -> Option<String> {
        lookup_ip_bounded(&self.dns, host, budget).await
    }

    async fn count_hit(&self, namespace: &str, host: &str, port: u16) {
        if let Some(store) = &self.store {
            if let Err(err) = store.incr(&format!("{namespace}:{host}-{port}")).await {
                tracing::warn!(host, port, err = %err, "store: hit counter increment failed");
            }
        }
    }

    /// Take the single-flight lease when both the store and the lock feature
    /// are on. `None` means "proceed without coalescing".
    async fn lock(&self, name: &str) -> Option<MutexGuard> {
        let store = self.store.as_ref()?;
        if !self.config.cache.enable_locks {
            return None;
        }
        let guard = store.acquire_mutex(name).await;
        if !guard.held() {
            tracing::debug!(key = %name, "resolver: proceeding without single-flight lock");
        }
        Some(guard)
    }

    async fn unlock(&self, guard: Option<MutexGuard>) {
        if let (Some(store), Some(mut guard)) = (self.store.as_ref(), guard) {
            store.release(&mut guard).await;
        }
    }

    async fn cache_put(&self, key: &str, body: &[u8], ttl: Duration) {
        if let Some(store) = &self.store {
            if let Err(err) = store.set(key, body, ttl).await {
                tracing::warn!(key, err = %err, "store: cache write failed");
            }
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

async fn lookup_ip_bounded(dns: &Dns, host: &str, budget: Duration) -> Option<String> {
    if host.parse::<IpAddr>().is_ok() {
        return Some(host.to_string());
    }
    time::timeout(budget, dns.lookup_ip(host)).await.ok().flatten()
}

/// Run a probe until it answers or its cancel channel flips. A closed channel
/// is not a cancel; the probe then just runs to its own deadline.
async fn cancellable<T>(
    fut: impl Future<Output = Option<T>>,
    mut cancel: watch::Receiver<bool>,
) -> Option<T> {
    tokio::select! {
        res = fut => res,
        _ = async {
            loop {
                if *cancel.borrow() {
                    return;
                }
                if cancel.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spyglass::blocklist::MojangBlocklist;
    use crate::spyglass::config::{CacheConfig, LoggingConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn test_config() -> Config {
        Config {
            environment: "test".into(),
            host: "127.0.0.1".into(),
            port: 0,
            redis: None,
            auth_tokens: Vec::new(),
            cache: CacheConfig {
                java_status_duration: Duration::from_secs(60),
                bedrock_status_duration: Duration::from_secs(60),
                icon_duration: Duration::from_secs(900),
                enable_locks: false,
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "discard".into(),
                add_source: false,
            },
        }
    }

    fn test_service() -> Service {
        Service::new(
            test_config(),
            None,
            Arc::new(MojangBlocklist::new()),
            Arc::new(Dns::new().expect("resolver")),
        )
    }

    /// Answers modern status conversations; leaves legacy pings hanging so the
    /// orchestrator has to cancel them.
    async fn spawn_java_fixture(body: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let first = conn.read_u8().await.unwrap_or(0xFE);
                    if first == 0xFE {
                        // Legacy ping: hold the socket open without answering.
                        let mut sink = vec![0u8; 512];
                        while matches!(conn.read(&mut sink).await, Ok(n) if n > 0) {}
                        return;
                    }

                    // `first` was the handshake length prefix (always < 0x80
                    // for our requests); drain handshake + status request.
                    let mut handshake = vec![0u8; first as usize];
                    let _ = conn.read_exact(&mut handshake).await;
                    let mut request = [0u8; 2];
                    let _ = conn.read_exact(&mut request).await;

                    let mut payload = vec![0x00];
                    payload.push(body.len() as u8); // fits in one varint byte
                    payload.extend_from_slice(body);
                    let mut framed = vec![payload.len() as u8];
                    framed.extend_from_slice(&payload);
                    let _ = conn.write_all(&framed).await;
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn resolve_java_merges_a_modern_reply() {
        let body = br#"{"version":{"name":"1.20.4","protocol":765},"players":{"online":3,"max":20},"description":"hi"}"#;
        let port = spawn_java_fixture(body).await;

        let service = test_service();
        let opts = StatusOptions {
            query: false,
            ..Default::default()
        };
        let (bytes, ttl) = service
            .resolve_java("127.0.0.1", port, &opts)
            .await
            .unwrap();
        assert_eq!(ttl, Duration::ZERO);

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["online"], serde_json::json!(true));
        assert_eq!(json["host"], "127.0.0.1");
        assert_eq!(json["ip_address"], "127.0.0.1");
        assert_eq!(json["version"]["protocol"], 765);
        assert_eq!(json["motd"]["raw"], "hi");
        assert!(json["eula_blocked"].as_bool() == Some(false));
    }

    #[tokio::test]
    async fn hanging_legacy_and_silent_query_are_cancelled_early() {
        let body = br#"{"description":"fast"}"#;
        let port = spawn_java_fixture(body).await;
        // A bound-but-mute UDP socket swallows the query probe's packets.
        let udp = tokio::net::UdpSocket::bind(("127.0.0.1", port)).await.ok();

        let service = test_service();
        let opts = StatusOptions {
            query: udp.is_some(),
            timeout: Duration::from_secs(5),
            ..Default::default()
        };

        let started = time::Instant::now();
        let (bytes, _) = service
            .resolve_java("127.0.0.1", port, &opts)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["online"], serde_json::json!(true));
        // Modern answers immediately; legacy is cancelled on its completion
        // and the query may only use the grace tail, never the full timeout.
        assert!(
            elapsed < Duration::from_secs(2),
            "took {elapsed:?}, early-cancel did not engage"
        );
    }

    #[tokio::test]
    async fn all_probes_failing_yields_an_offline_document() {
        // Connect to a closed port: both TCP probes fail fast.
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let service = test_service();
        let opts = StatusOptions {
            query: false,
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let (bytes, _) = service
            .resolve_java("127.0.0.1", port, &opts)
            .await
            .unwrap();

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["online"], serde_json::json!(false));
        assert!(json.get("motd").is_none());
        assert_eq!(json["port"], serde_json::json!(port));
    }

    #[tokio::test]
    async fn resolve_icon_falls_back_to_default_when_no_favicon() {
        let body = br#"{"description":"no favicon here"}"#;
        let port = spawn_java_fixture(body).await;

        let service = test_service();
        let (bytes, ttl) = service
            .resolve_icon("127.0.0.1", port, &StatusOptions::default())
            .await
            .unwrap();
        assert_eq!(ttl, Duration::ZERO);
        assert_eq!(&bytes[..4], &[0x89, 0x50, 0x4E, 0x47]);
    }

    #[tokio::test]
    async fn resolve_bedrock_offline_is_envelope_only() {
        // An unanswered UDP port: bind and drop nothing, just never reply.
        let udp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = udp.local_addr().unwrap().port();

        let service = test_service();
        let opts = StatusOptions {
            query: false,
            timeout: Duration::from_millis(800),
            ..Default::default()
        };
        let (bytes, _) = service
            .resolve_bedrock("127.0.0.1", port, &opts)
            .await
            .unwrap();

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["online"], serde_json::json!(false));
        assert!(json.get("edition").is_none());
    }

    #[tokio::test]
    async fn cancelled_probe_returns_none() {
        let (tx, rx) = watch::channel(false);
        let probe = cancellable(
            async {
                time::sleep(Duration::from_secs(30)).await;
                Some(1)
            },
            rx,
        );
        tokio::pin!(probe);

        tokio::select! {
            biased;
            _ = &mut probe => panic!("probe finished without cancel"),
            _ = time::sleep(Duration::from_millis(10)) => {}
        }

        tx.send(true).unwrap();
        assert_eq!(probe.await, None);
    }

    #[tokio::test]
    async fn dropping_the_cancel_sender_is_not_a_cancel() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let got = cancellable(
            async {
                time::sleep(Duration::from_millis(10)).await;
                Some(7)
            },
            rx,
        )
        .await;
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn legacy_fixture_socket_stays_quiet() {
        // Sanity-check the fixture itself: a legacy ping never gets a reply.
        let port = spawn_java_fixture(br#"{"description":"x"}"#).await;
        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(&[0xFE, 0x01]).await.unwrap();

        let mut buf = [0u8; 1];
        let got = time::timeout(Duration::from_millis(300), conn.read(&mut buf)).await;
        assert!(got.is_err(), "fixture answered a legacy ping");
    }
}
