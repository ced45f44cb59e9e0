use std::net::IpAddr;
use std::time::Duration;

use larder_core::error::AppError;
use larder_core::throttle::DomainPacer;
use larder_core::traits::{FetchOptions, Fetcher};
use reqwest::Client;
use url::Url;

use crate::identity::{ClientIdentity, IdentityRotation};

/// HTTP fetcher using reqwest.
///
/// Retries transient failures up to [`FetchOptions::max_retries`] attempts
/// with linear backoff, presenting a different client identity on each
/// attempt. 404/410 and other non-retryable statuses are surfaced at once.
/// Behind a `PacedFetcher` every attempt waits for the domain's pacer.
///
/// By default, SSRF protection is **enabled**: requests to private/reserved
/// IP ranges are blocked. Use [`allow_private_urls`](Self::allow_private_urls)
/// to disable this (e.g., for CLI usage where the user controls the machine).
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    identities: IdentityRotation,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            identities: IdentityRotation::new(),
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    ///
    /// Only use this for CLI usage where the user controls the machine.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    async fn attempt(
        &self,
        url: &str,
        options: &FetchOptions,
        identity: &ClientIdentity,
    ) -> Result<String, AppError> {
        let mut request = self
            .client
            .get(url)
            .headers(identity.header_map())
            .timeout(options.timeout);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(options.timeout.as_millis() as u64)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(options.timeout.as_millis() as u64)
            } else {
                AppError::HttpError(format!("Failed to read response body: {e}"))
            }
        })
    }
}

impl ReqwestFetcher {
    /// The retry loop. `pacer`, when given, is awaited before every attempt
    /// so retries queue behind other requests to the same domain.
    async fn fetch_with_retries(
        &self,
        url: &str,
        options: &FetchOptions,
        pacer: Option<&DomainPacer>,
    ) -> Result<String, AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }

        let attempts = options.max_retries.max(1);
        let mut last_error = None;

        for (attempt, identity) in (1..=attempts).zip(self.identities.sequence()) {
            if attempt > 1 {
                let wait = options.backoff * (attempt - 1);
                tracing::debug!(%url, %attempt, wait_ms = %wait.as_millis(), "Backing off before retry");
                tokio::time::sleep(wait).await;
            }
            if let Some(pacer) = pacer {
                pacer.wait_for_url(url).await;
            }

            match self.attempt(url, options, identity).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        %url,
                        %attempt,
                        max_attempts = %attempts,
                        identity = identity.name,
                        error = %e,
                        "Fetch attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    return Err(AppError::Fetch {
                        url: url.to_string(),
                        attempts: attempt,
                        cause: Box::new(e),
                    });
                }
            }
        }

        Err(AppError::Fetch {
            url: url.to_string(),
            attempts,
            cause: Box::new(
                last_error.unwrap_or_else(|| AppError::HttpError("no attempt made".into())),
            ),
        })
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch_text(&self, url: &str, options: &FetchOptions) -> Result<String, AppError> {
        self.fetch_with_retries(url, options, None).await
    }

    async fn fetch_text_paced(
        &self,
        url: &str,
        options: &FetchOptions,
        pacer: &DomainPacer,
    ) -> Result<String, AppError> {
        self.fetch_with_retries(url, options, Some(pacer)).await
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::HttpError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::HttpError("URL has no host".to_string()))?;

    // IP literals are checked directly; IPv6 hosts come bracketed.
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::HttpError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addr = format!("{host}:{port}");
    let addrs: Vec<_> = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(AppError::HttpError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16 (cloud metadata)
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}
