use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DriverSection;
use crate::device::DeviceProfile;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("script evaluation failed: {0}")]
    Evaluation(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("session cancelled")]
    Cancelled,
    #[error("driver configuration error: {0}")]
    Configuration(String),
}

/// An outbound link candidate harvested from the current page.
#[derive(Debug, Clone, Deserialize)]
pub struct PageLink {
    pub href: String,
}

/// One open browsing context. `navigate` resolves only once the page has
/// reached quiescence; `close` must be idempotent.
#[async_trait]
pub trait BrowserContext: Send {
    async fn navigate(&mut self, url: &str) -> DriverResult<()>;
    async fn evaluate(&mut self, script: &str) -> DriverResult<()>;
    /// Outbound links only: candidates pointing back at the host the context
    /// last navigated to are filtered out.
    async fn query_links(&mut self) -> DriverResult<Vec<PageLink>>;
    async fn close(&mut self) -> DriverResult<()>;
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_context(
        &self,
        device: &DeviceProfile,
        proxy: Option<&str>,
    ) -> DriverResult<Box<dyn BrowserContext>>;
}

const LINK_COLLECTOR_SCRIPT: &str = r#"
(() => {
    return Array.from(document.querySelectorAll('a[href^="http"]'))
        .map((anchor) => ({ href: anchor.href }));
})()
"#;

// Mirrors the classic webdriver/permissions masking applied by the
// automation it replaces; correctness of the masking itself is out of scope.
const STEALTH_INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
"#;

/// Production driver: one Chromium instance per browsing context, configured
/// with the device fingerprint and optional proxy egress.
#[derive(Debug, Clone)]
pub struct ChromiumDriver {
    config: DriverSection,
}

impl ChromiumDriver {
    pub fn new(config: DriverSection) -> Self {
        Self { config }
    }

    fn build_chromium_config(
        &self,
        device: &DeviceProfile,
        proxy: Option<&str>,
    ) -> DriverResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .chrome_executable(&self.config.executable_path)
            .viewport(ChromiumViewport {
                width: device.viewport_width,
                height: device.viewport_height,
                device_scale_factor: Some(device.device_scale_factor()),
                emulating_mobile: device.is_mobile(),
                is_landscape: device.viewport_width >= device.viewport_height,
                has_touch: device.has_touch(),
            });

        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }

        let mut args = vec![
            format!("--user-agent={}", device.user_agent),
            format!(
                "--window-size={},{}",
                device.viewport_width, device.viewport_height
            ),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--no-first-run".to_string(),
            "--mute-audio".to_string(),
        ];
        if let Some(proxy) = proxy {
            args.push(format!("--proxy-server={proxy}"));
        }
        builder = builder.args(args);

        builder.build().map_err(DriverError::Configuration)
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn open_context(
        &self,
        device: &DeviceProfile,
        proxy: Option<&str>,
    ) -> DriverResult<Box<dyn BrowserContext>> {
        let chromium_config = self.build_chromium_config(device, proxy)?;
        info!(
            device = %device.name,
            proxy = proxy.unwrap_or("direct"),
            headless = self.config.headless,
            "opening browsing context"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| DriverError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await
            .map_err(|err| DriverError::Launch(err.to_string()))?;
        configure_page(&page, device).await?;

        Ok(Box::new(ChromiumContext {
            browser: Some(browser),
            page: Some(page),
            handler_task: Some(handler_task),
            origin_host: None,
            navigation_timeout: Duration::from_secs(self.config.navigation_timeout_s),
        }))
    }
}

async fn configure_page(page: &Page, device: &DeviceProfile) -> DriverResult<()> {
    page.enable_stealth_mode_with_agent(&device.user_agent)
        .await
        .map_err(|err| DriverError::Configuration(err.to_string()))?;

    let params = SetUserAgentOverrideParams::builder()
        .user_agent(device.user_agent.clone())
        .build()
        .map_err(DriverError::Configuration)?;
    page.set_user_agent(params)
        .await
        .map_err(|err| DriverError::Configuration(err.to_string()))?;

    page.evaluate_on_new_document(
        AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(STEALTH_INIT_SCRIPT)
            .build()
            .map_err(DriverError::Configuration)?,
    )
    .await
    .map_err(|err| DriverError::Configuration(err.to_string()))?;
    Ok(())
}

struct ChromiumContext {
    browser: Option<Browser>,
    page: Option<Page>,
    handler_task: Option<JoinHandle<()>>,
    origin_host: Option<String>,
    navigation_timeout: Duration,
}

impl ChromiumContext {
    fn page(&self) -> DriverResult<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| DriverError::Navigation("browsing context already closed".to_string()))
    }
}

#[async_trait]
impl BrowserContext for ChromiumContext {
    async fn navigate(&mut self, url: &str) -> DriverResult<()> {
        let page = self.page()?;
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(DriverError::Configuration)?;
        let navigation = async {
            page.goto(params)
                .await
                .map_err(|err| DriverError::Navigation(err.to_string()))?;
            page.wait_for_navigation()
                .await
                .map_err(|err| DriverError::Navigation(err.to_string()))?;
            Ok(())
        };
        timeout(self.navigation_timeout, navigation)
            .await
            .map_err(|_| DriverError::Timeout(format!("navigation to {url}")))??;
        self.origin_host = host_of(url);
        Ok(())
    }

    async fn evaluate(&mut self, script: &str) -> DriverResult<()> {
        let page = self.page()?;
        page.evaluate(script)
            .await
            .map_err(|err| DriverError::Evaluation(err.to_string()))?;
        Ok(())
    }

    async fn query_links(&mut self) -> DriverResult<Vec<PageLink>> {
        let page = self.page()?;
        let value: serde_json::Value = page
            .evaluate(LINK_COLLECTOR_SCRIPT)
            .await
            .map_err(|err| DriverError::Evaluation(err.to_string()))?
            .into_value()
            .map_err(|err| DriverError::Evaluation(format!("failed to decode links: {err}")))?;
        let links: Vec<PageLink> = serde_json::from_value(value)
            .map_err(|err| DriverError::Evaluation(format!("failed to parse links: {err}")))?;
        Ok(filter_outbound(links, self.origin_host.as_deref()))
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.page = None;
        if let Some(mut browser) = self.browser.take() {
            if let Err(err) = browser.close().await {
                warn!(error = %err, "failed to close browser gracefully");
            }
            if let Some(handle) = self.handler_task.take() {
                if let Err(err) = handle.await {
                    warn!(error = %err, "browser handler join error");
                }
            }
        }
        Ok(())
    }
}

impl Drop for ChromiumContext {
    fn drop(&mut self) {
        if self.browser.is_some() {
            warn!("browsing context dropped without explicit close");
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(normalize_host))
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches("www.").to_ascii_lowercase()
}

fn filter_outbound(links: Vec<PageLink>, origin_host: Option<&str>) -> Vec<PageLink> {
    links
        .into_iter()
        .filter(|link| match (host_of(&link.href), origin_host) {
            (Some(host), Some(origin)) => host != origin,
            (Some(_), None) => true,
            (None, _) => false,
        })
        .collect()
}
