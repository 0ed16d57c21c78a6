//! Resource resolution: turn a user-supplied image reference into something
//! the renderer can load reliably.
//!
//! Resolution never fails. Every problem is reported as
//! [`Resolution::Degraded`], which still carries a reference the renderer can
//! try to load directly.

pub mod cache;
pub mod normalize;

use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub use cache::{content_key, CacheSweeper, ResourceCache, SweepPolicy, SweepReport};
pub use normalize::normalize;

use crate::{Error, Result};

/// Which slot of the template a resource fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceRole {
    Background,
    News,
}

impl ResourceRole {
    pub const ALL: [ResourceRole; 2] = [ResourceRole::Background, ResourceRole::News];

    /// Short tag used in cache file names
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceRole::Background => "bg",
            ResourceRole::News => "news",
        }
    }
}

/// Outcome of resolving one image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No reference was supplied
    Absent,
    /// Bytes are on local disk; `href` is how the renderer should load them
    Local {
        path: PathBuf,
        href: String,
        cache_hit: bool,
    },
    /// Inline or local scheme (`data:`, `file:`) used as is
    Direct { href: String },
    /// Fetching failed; `href` is the reference as supplied (after share-link
    /// normalization) so the renderer can still attempt it
    Degraded { href: String, reason: String },
}

impl Resolution {
    pub fn href(&self) -> Option<&str> {
        match self {
            Resolution::Absent => None,
            Resolution::Local { href, .. }
            | Resolution::Direct { href }
            | Resolution::Degraded { href, .. } => Some(href),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Resolution::Degraded { .. })
    }
}

/// Credentialed proxy able to fetch raw bytes from interstitial hosts
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Directory cache files are written to (the shared output directory)
    pub cache_dir: PathBuf,
    /// Public base under which `cache_dir` is served; `file://` when unset
    pub asset_base_url: Option<String>,
    pub proxy: Option<ProxyConfig>,
    /// Hosts whose links are fetched through `proxy` before a direct attempt
    pub proxy_hosts: Vec<String>,
    pub fetch_timeout: Duration,
    pub user_agent: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("output"),
            asset_base_url: None,
            proxy: None,
            proxy_hosts: normalize::DRIVE_HOSTS.iter().map(|h| h.to_string()).collect(),
            fetch_timeout: Duration::from_secs(20),
            user_agent: concat!("newscard/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

pub struct Resolver {
    client: reqwest::Client,
    cache: ResourceCache,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(mut config: ResolverConfig) -> Result<Self> {
        if config.cache_dir.is_relative() {
            config.cache_dir = std::env::current_dir()?.join(&config.cache_dir);
        }
        std::fs::create_dir_all(&config.cache_dir)?;

        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            cache: ResourceCache::new(config.cache_dir.clone()),
            config,
        })
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Resolve one reference for `job_id`. Never fails.
    pub async fn resolve(&self, job_id: &str, raw: Option<&str>, role: ResourceRole) -> Resolution {
        let raw = match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(r) => r,
            None => return Resolution::Absent,
        };
        let normalized = normalize::normalize(raw);

        let parsed = match Url::parse(&normalized) {
            Ok(u) => u,
            Err(e) => {
                warn!("[{}] {} reference is not a URL: {}", job_id, role.as_str(), e);
                return Resolution::Degraded {
                    href: normalized,
                    reason: format!("not a URL: {}", e),
                };
            }
        };
        match parsed.scheme() {
            "http" | "https" => {}
            "data" | "file" => return Resolution::Direct { href: normalized },
            other => {
                return Resolution::Degraded {
                    reason: format!("unsupported scheme {}", other),
                    href: normalized,
                }
            }
        }

        if normalize::is_interstitial_host(&parsed, &self.config.proxy_hosts) {
            if let (Some(proxy), Some(file_id)) =
                (&self.config.proxy, normalize::drive_file_id(&normalized))
            {
                match self.fetch_via_proxy(job_id, proxy, &file_id, role).await {
                    Ok(res) => return res,
                    Err(e) => warn!(
                        "[{}] proxy fetch for {} failed, falling back to direct fetch: {}",
                        job_id,
                        role.as_str(),
                        e
                    ),
                }
            }
        }

        match self.prefetch(job_id, &parsed, role).await {
            Ok(res) => res,
            Err(e) => {
                let degraded = Error::ResolutionDegraded {
                    url: normalized.clone(),
                    reason: e.to_string(),
                };
                warn!("[{}] {}", job_id, degraded);
                Resolution::Degraded {
                    href: normalized,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn fetch_via_proxy(
        &self,
        job_id: &str,
        proxy: &ProxyConfig,
        file_id: &str,
        role: ResourceRole,
    ) -> Result<Resolution> {
        if let Some(path) = self.cache.lookup(role, file_id).await {
            debug!("[{}] proxy cache hit for {} {}", job_id, role.as_str(), file_id);
            return Ok(self.local(path, true));
        }

        let mut req = self
            .client
            .get(&proxy.url)
            .query(&[("id", file_id), ("direct", "1")]);
        if let Some(token) = &proxy.token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::NetworkError(format!("proxy responded {}", status)));
        }
        let content_type = header_content_type(&response);
        if is_html(content_type.as_deref()) {
            return Err(Error::NetworkError("proxy returned an HTML page".into()));
        }

        let ext = content_type
            .as_deref()
            .and_then(extension_for_content_type)
            .unwrap_or_else(|| ".bin".to_string());
        let name = cache::cache_file_name(job_id, role, file_id, &ext);
        let path = self.cache.store_response(&name, response).await?;
        self.cache.remember(role, file_id, &path);
        Ok(self.local(path, false))
    }

    async fn prefetch(&self, job_id: &str, url: &Url, role: ResourceRole) -> Result<Resolution> {
        let key = content_key(url.as_str());
        if let Some(path) = self.cache.lookup(role, &key).await {
            debug!("[{}] cache hit for {} {}", job_id, role.as_str(), url);
            return Ok(self.local(path, true));
        }

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::NetworkError(format!("{} responded {}", url, status)));
        }
        let content_type = header_content_type(&response);
        if is_html(content_type.as_deref()) {
            return Err(Error::NetworkError(format!("{} returned an HTML page", url)));
        }

        let ext = url_extension(url)
            .or_else(|| content_type.as_deref().and_then(extension_for_content_type))
            .unwrap_or_else(|| ".bin".to_string());
        let name = cache::cache_file_name(job_id, role, &key, &ext);
        let path = self.cache.store_response(&name, response).await?;
        self.cache.remember(role, &key, &path);
        Ok(self.local(path, false))
    }

    fn local(&self, path: PathBuf, cache_hit: bool) -> Resolution {
        let href = self.href_for(&path);
        Resolution::Local {
            path,
            href,
            cache_hit,
        }
    }

    fn href_for(&self, path: &Path) -> String {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match &self.config.asset_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), file_name),
            None => Url::from_file_path(path)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| path.display().to_string()),
        }
    }
}

fn header_content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn is_html(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.trim().to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

/// Extension carried by the URL path itself, with a leading dot
fn url_extension(url: &Url) -> Option<String> {
    let last = url.path_segments()?.last()?;
    let dot = last.rfind('.')?;
    let ext = &last[dot + 1..];
    if (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(format!(".{}", ext.to_ascii_lowercase()))
    } else {
        None
    }
}

/// Extension for a declared content type, with a leading dot
pub fn extension_for_content_type(content_type: &str) -> Option<String> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let known = match essence.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/svg+xml" => Some("svg"),
        "image/avif" => Some("avif"),
        "image/bmp" => Some("bmp"),
        _ => None,
    };
    if let Some(ext) = known {
        return Some(format!(".{}", ext));
    }
    mime_guess::get_mime_extensions_str(&essence)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{}", ext))
}
