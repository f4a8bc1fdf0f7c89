use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps SPYGLASS_CONFIG into the flag value when unset, but keep the
    // precedence visible by treating it as "env" when present.
    if let Some(p) = std::env::var_os("SPYGLASS_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: PathBuf::from("spyglass.yml"),
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    let meta = fs::metadata(&p);
    if let Ok(m) = meta {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("spyglass.yml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .yml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("yml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["spyglass.yml", "spyglass.yaml", "spyglass.toml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no spyglass.* found")
}

pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!("config: {} exists but is not a regular file", path.display());
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .yml/.yaml or .toml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    let mut cfg = Config::from_file_config(fc)?;
    cfg.override_with_env()?;
    Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub redis: Option<String>,
    pub auth_tokens: Vec<String>,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub java_status_duration: Duration,
    pub bedrock_status_duration: Duration,
    pub icon_duration: Duration,
    pub enable_locks: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    environment: String,

    #[serde(default)]
    host: String,

    #[serde(default)]
    port: u16,

    redis: Option<String>,

    #[serde(default)]
    auth_tokens: Vec<String>,

    cache: Option<FileCache>,

    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileCache {
    java_status_duration: Option<String>,
    bedrock_status_duration: Option<String>,
    icon_duration: Option<String>,
    enable_locks: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            environment: fc.environment.trim().to_string(),
            host: fc.host.trim().to_string(),
            port: fc.port,
            redis: fc
                .redis
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            auth_tokens: fc
                .auth_tokens
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            cache: CacheConfig {
                java_status_duration: Duration::from_secs(60),
                bedrock_status_duration: Duration::from_secs(60),
                icon_duration: Duration::from_secs(15 * 60),
                enable_locks: true,
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        if cfg.environment.is_empty() {
            cfg.environment = "production".into();
        }
        if cfg.host.is_empty() {
            cfg.host = "127.0.0.1".into();
        }
        if cfg.port == 0 {
            cfg.port = 3001;
        }

        if let Some(c) = &fc.cache {
            if let Some(d) = parse_duration_field(c.java_status_duration.as_deref())
                .context("config: cache.java_status_duration")?
            {
                cfg.cache.java_status_duration = d;
            }
            if let Some(d) = parse_duration_field(c.bedrock_status_duration.as_deref())
                .context("config: cache.bedrock_status_duration")?
            {
                cfg.cache.bedrock_status_duration = d;
            }
            if let Some(d) = parse_duration_field(c.icon_duration.as_deref())
                .context("config: cache.icon_duration")?
            {
                cfg.cache.icon_duration = d;
            }
            if let Some(enable) = c.enable_locks {
                cfg.cache.enable_locks = enable;
            }
        }

        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    cfg.logging.level = level.trim().to_string();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    cfg.logging.format = fmt.trim().to_string();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    cfg.logging.output = out.trim().to_string();
                }
            }
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }

    fn override_with_env(&mut self) -> anyhow::Result<()> {
        if let Ok(env) = std::env::var("ENVIRONMENT") {
            if !env.trim().is_empty() {
                self.environment = env.trim().to_string();
            }
        }
        if let Ok(host) = std::env::var("HOST") {
            if !host.trim().is_empty() {
                self.host = host.trim().to_string();
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if !port.trim().is_empty() {
                self.port = port
                    .trim()
                    .parse()
                    .context("config: invalid PORT environment variable")?;
            }
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.trim().is_empty() {
                self.redis = Some(url.trim().to_string());
            }
        }

        // INSTANCE_ID offsets the listen port so several replicas can share a host.
        if let Ok(id) = std::env::var("INSTANCE_ID") {
            if !id.trim().is_empty() {
                let offset: u16 = id
                    .trim()
                    .parse()
                    .context("config: invalid INSTANCE_ID environment variable")?;
                self.port = self
                    .port
                    .checked_add(offset)
                    .context("config: INSTANCE_ID overflows listen port")?;
            }
        }

        Ok(())
    }
}

fn parse_duration_field(v: Option<&str>) -> anyhow::Result<Option<Duration>> {
    let Some(s) = v else { return Ok(None) };
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let d = humantime::parse_duration(s)?;
    Ok(Some(d))
}

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Spyglass configuration (auto-generated)
#
# This file was created because Spyglass could not find a configuration file at
# the resolved config path. It is runnable without edits; the service listens
# on 127.0.0.1:3001 and, with no redis URL, caching and request coalescing are
# disabled.

environment: "production"
host: "127.0.0.1"
port: 3001

# Key-value store URL, e.g. redis://127.0.0.1:6379/0. Leave unset to disable
# the response cache, the single-flight locks and the hit counters.
# redis: "redis://127.0.0.1:6379/0"

# Authorization tokens allowed to use ?bypass_cache=true.
auth_tokens: []

cache:
  java_status_duration: "1m"
  bedrock_status_duration: "1m"
  icon_duration: "15m"
  enable_locks: true

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Spyglass configuration (auto-generated)
#
# This file was created because Spyglass could not find a configuration file at
# the resolved config path. It is runnable without edits; the service listens
# on 127.0.0.1:3001 and, with no redis URL, caching and request coalescing are
# disabled.

environment = "production"
host = "127.0.0.1"
port = 3001

# Key-value store URL, e.g. redis://127.0.0.1:6379/0. Leave unset to disable
# the response cache, the single-flight locks and the hit counters.
# redis = "redis://127.0.0.1:6379/0"

# Authorization tokens allowed to use ?bypass_cache=true.
auth_tokens = []

[cache]
java_status_duration = "1m"
bedrock_status_duration = "1m"
icon_duration = "15m"
enable_locks = true

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;
