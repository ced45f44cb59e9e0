//! Rotating client identities.
//!
//! Each identity is a coherent header set: a User-Agent plus the Accept,
//! Accept-Language and client-hint headers that browser would actually send.
//! The fetcher presents a different identity on every attempt at a URL.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};

const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

/// One coherent set of request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub name: &'static str,
    pub user_agent: &'static str,
    pub headers: &'static [(&'static str, &'static str)],
}

impl ClientIdentity {
    /// Full header map for this identity, including User-Agent.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in self.headers {
            let Ok(name) = HeaderName::from_bytes(k.to_ascii_lowercase().as_bytes()) else {
                continue;
            };
            if let Ok(value) = HeaderValue::from_str(v) {
                map.insert(name, value);
            }
        }
        if let Ok(ua) = HeaderValue::from_str(self.user_agent) {
            map.insert(USER_AGENT, ua);
        }
        map
    }
}

pub static IDENTITIES: &[ClientIdentity] = &[
    ClientIdentity {
        name: "chrome-macos",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        headers: &[
            ("Accept", ACCEPT_HTML),
            ("Accept-Language", "en-US,en;q=0.9"),
            ("Upgrade-Insecure-Requests", "1"),
            ("Sec-Fetch-Dest", "document"),
            ("Sec-Fetch-Mode", "navigate"),
            ("Sec-Fetch-Site", "none"),
            (
                "Sec-Ch-Ua",
                "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"",
            ),
            ("Sec-Ch-Ua-Mobile", "?0"),
            ("Sec-Ch-Ua-Platform", "\"macOS\""),
        ],
    },
    ClientIdentity {
        name: "firefox-windows",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
        headers: &[
            ("Accept", ACCEPT_HTML),
            ("Accept-Language", "en-US,en;q=0.5"),
            ("Upgrade-Insecure-Requests", "1"),
            ("Sec-Fetch-Dest", "document"),
            ("Sec-Fetch-Mode", "navigate"),
            ("Sec-Fetch-Site", "none"),
        ],
    },
    ClientIdentity {
        name: "safari-macos",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
        headers: &[
            ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
            ("Accept-Language", "en-GB,en;q=0.9"),
        ],
    },
    ClientIdentity {
        name: "chrome-android",
        user_agent: "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36",
        headers: &[
            ("Accept", ACCEPT_HTML),
            ("Accept-Language", "en-US,en;q=0.9"),
            ("Upgrade-Insecure-Requests", "1"),
            ("Sec-Fetch-Dest", "document"),
            ("Sec-Fetch-Mode", "navigate"),
            ("Sec-Fetch-Site", "none"),
            ("Sec-Fetch-User", "?1"),
            (
                "Sec-Ch-Ua",
                "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"",
            ),
            ("Sec-Ch-Ua-Mobile", "?1"),
            ("Sec-Ch-Ua-Platform", "\"Android\""),
        ],
    },
];

/// Round-robin over [`IDENTITIES`], shared across clones.
///
/// Each fetch takes one starting offset and walks the table from there, so
/// its attempts never repeat an identity (until the table wraps) however
/// many other fetches run concurrently.
#[derive(Debug, Clone, Default)]
pub struct IdentityRotation {
    next: Arc<AtomicUsize>,
}

impl IdentityRotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities for the attempts of one fetch, in order.
    pub fn sequence(&self) -> impl Iterator<Item = &'static ClientIdentity> + Send + use<> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % IDENTITIES.len();
        IDENTITIES.iter().cycle().skip(start)
    }
}
