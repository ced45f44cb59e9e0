use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use larder_core::error::AppError;
use larder_core::traits::Renderer;
use tokio::time::Instant;

/// Markup that shows a client-side recipe has been injected into the DOM.
const RECIPE_READY_SELECTORS: &[&str] = &[
    r#"script[type="application/ld+json"]"#,
    r#"[itemtype*="schema.org/Recipe"]"#,
    ".wprm-recipe-container",
    ".tasty-recipes",
    ".mv-create-card",
];

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_SETTLE: Duration = Duration::from_secs(5);

const CHROME_CANDIDATES: &[&str] = &[
    "/snap/chromium/current/usr/lib/chromium-browser/chrome",
    "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
];

/// Headless Chromium renderer, the last-resort fallback of the extraction chain.
///
/// One Chromium process is shared across clones. Each render opens a blank
/// tab, navigates, then polls for recipe markup (JSON-LD, microdata or a
/// recipe-card container) for up to the settle window before snapshotting
/// the DOM. The tab is closed on every path, including timeouts.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use larder_client::BrowserRenderer;
/// use larder_core::traits::Renderer;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let renderer = BrowserRenderer::new().await?.with_settle(Duration::from_secs(3));
/// let html = renderer.render("https://example.com/recipes/pie").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BrowserRenderer {
    browser: Arc<Browser>,
    timeout: Duration,
    settle: Duration,
}

impl BrowserRenderer {
    /// Launches Chromium with a 20 s render timeout.
    pub async fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(20)).await
    }

    /// Launches Chromium; `timeout` bounds each whole render.
    pub async fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // Snap wrappers reject standard Chrome flags; prefer the real binary.
        let env_override = std::env::var_os("CHROME_BIN").map(PathBuf::from);
        if let Some(bin) = locate_binary(env_override, CHROME_CANDIDATES) {
            tracing::info!(binary = %bin.display(), "Using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::RenderError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::RenderError(format!("Failed to launch browser: {e}")))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(error = %e, "Browser CDP handler stopped");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            timeout,
            settle: DEFAULT_SETTLE.min(timeout),
        })
    }

    /// How long to wait for recipe markup before taking the DOM as is.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    async fn load(&self, page: &Page, url: &str) -> Result<String, AppError> {
        page.goto(url)
            .await
            .map_err(|e| AppError::RenderError(format!("Failed to navigate to {url}: {e}")))?;
        page.find_element("body")
            .await
            .map_err(|e| AppError::RenderError(format!("Page did not render body: {e}")))?;

        if !self.wait_for_recipe_markup(page).await {
            tracing::debug!(%url, settle_ms = %self.settle.as_millis(), "No recipe markup after settling");
        }

        page.content()
            .await
            .map_err(|e| AppError::RenderError(format!("Failed to read page content: {e}")))
    }

    async fn wait_for_recipe_markup(&self, page: &Page) -> bool {
        let selector = ready_selector();
        let deadline = Instant::now() + self.settle;
        loop {
            let found = page
                .find_elements(selector.as_str())
                .await
                .is_ok_and(|elements| !elements.is_empty());
            if found {
                return true;
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl Renderer for BrowserRenderer {
    async fn render(&self, url: &str) -> Result<String, AppError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::RenderError(format!("Failed to open tab: {e}")))?;

        let outcome = tokio::time::timeout(self.timeout, self.load(&page, url)).await;

        if let Err(e) = page.close().await {
            tracing::debug!(%url, error = %e, "Failed to close tab");
        }

        match outcome {
            Ok(rendered) => rendered,
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                tracing::warn!(%url, %timeout_ms, "Render timed out");
                Err(AppError::Timeout(timeout_ms))
            }
        }
    }
}

fn ready_selector() -> String {
    RECIPE_READY_SELECTORS.join(", ")
}

/// `CHROME_BIN` if it exists, else the first existing candidate. `None` lets
/// chromiumoxide do its own lookup.
fn locate_binary(env_override: Option<PathBuf>, candidates: &[&str]) -> Option<PathBuf> {
    env_override
        .filter(|path| path.exists())
        .or_else(|| candidates.iter().map(PathBuf::from).find(|p| p.exists()))
}
