//! Browser session abstraction over WebDriver.
//!
//! The executor drives a [`BrowserSession`] so tests can script a fake
//! session; production runs go through fantoccini against a WebDriver
//! endpoint (chromedriver/geckodriver).

use std::time::Duration;

use anyhow::{Context, Result};
use fantoccini::{Client, ClientBuilder, Locator};
use tokio::time::Instant;

/// One isolated browser page for the duration of a run.
#[async_trait::async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<()>;
    async fn fill(&mut self, selector: &str, value: &str) -> Result<()>;
    async fn select_option(&mut self, selector: &str, value: &str) -> Result<()>;
    async fn set_checkbox(&mut self, selector: &str, checked: bool) -> Result<()>;
    async fn pick_radio(&mut self, selector: &str, value: &str) -> Result<()>;
    async fn click(&mut self, selector: &str) -> Result<()>;
    /// Wait for a selector to appear. `Ok(false)` means the wait timed out.
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<bool>;
    /// Wait for the page to settle after an action, bounded by `timeout`.
    async fn wait_for_idle(&mut self, timeout: Duration) -> Result<()>;
    /// PNG capture of the current viewport.
    async fn screenshot(&mut self) -> Result<Vec<u8>>;
    async fn close(&mut self) -> Result<()>;
}

/// fantoccini-backed session.
pub struct WebDriverSession {
    client: Client,
}

impl WebDriverSession {
    /// Open a fresh WebDriver session.
    pub async fn connect(webdriver_url: &str) -> Result<Self> {
        let client = ClientBuilder::native()
            .connect(webdriver_url)
            .await
            .with_context(|| format!("failed to connect to WebDriver at {}", webdriver_url))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.client.goto(url))
            .await
            .map_err(|_| anyhow::anyhow!("navigation to {} timed out after {:?}", url, timeout))?
            .with_context(|| format!("navigation to {} failed", url))?;
        Ok(())
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        let elem = self
            .client
            .find(Locator::Css(selector))
            .await
            .with_context(|| format!("field selector '{}' not found", selector))?;
        elem.clear().await.ok();
        elem.send_keys(value)
            .await
            .with_context(|| format!("failed to type into '{}'", selector))?;
        Ok(())
    }

    async fn select_option(&mut self, selector: &str, value: &str) -> Result<()> {
        let elem = self
            .client
            .find(Locator::Css(selector))
            .await
            .with_context(|| format!("select selector '{}' not found", selector))?;
        elem.select_by_value(value)
            .await
            .with_context(|| format!("failed to select '{}' in '{}'", value, selector))?;
        Ok(())
    }

    async fn set_checkbox(&mut self, selector: &str, checked: bool) -> Result<()> {
        let elem = self
            .client
            .find(Locator::Css(selector))
            .await
            .with_context(|| format!("checkbox selector '{}' not found", selector))?;
        let selected = elem
            .is_selected()
            .await
            .with_context(|| format!("failed to read state of '{}'", selector))?;
        if selected != checked {
            elem.click()
                .await
                .with_context(|| format!("failed to toggle '{}'", selector))?;
        }
        Ok(())
    }

    async fn pick_radio(&mut self, selector: &str, value: &str) -> Result<()> {
        // Prefer the group member carrying the requested value; fall back to
        // the bare selector when the config already points at one input.
        let qualified = format!("{}[value=\"{}\"]", selector, value);
        let elem = match self.client.find(Locator::Css(&qualified)).await {
            Ok(e) => e,
            Err(_) => self
                .client
                .find(Locator::Css(selector))
                .await
                .with_context(|| format!("radio selector '{}' not found", selector))?,
        };
        elem.click()
            .await
            .with_context(|| format!("failed to pick radio '{}'", selector))?;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        let elem = self
            .client
            .find(Locator::Css(selector))
            .await
            .with_context(|| format!("selector '{}' not found", selector))?;
        elem.click()
            .await
            .with_context(|| format!("failed to click '{}'", selector))?;
        Ok(())
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<bool> {
        let found = self
            .client
            .wait()
            .at_most(timeout)
            .for_element(Locator::Css(selector))
            .await;
        Ok(found.is_ok())
    }

    async fn wait_for_idle(&mut self, timeout: Duration) -> Result<()> {
        // WebDriver exposes no network-idle signal; document.readyState is
        // the closest observable proxy.
        let deadline = Instant::now() + timeout;
        loop {
            let state = self
                .client
                .execute("return document.readyState;", vec![])
                .await
                .context("failed to query document.readyState")?;
            if state.as_str() == Some("complete") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for page to settle");
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        self.client
            .screenshot()
            .await
            .context("screenshot capture failed")
    }

    async fn close(&mut self) -> Result<()> {
        self.client
            .clone()
            .close()
            .await
            .context("failed to close browser session")
    }
}
