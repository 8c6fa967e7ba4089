//! `MarketplaceClient` trait plus an HTTP implementation (§4.G), grounded on
//! `marketplace.rs`'s `MarketplaceClient` (reqwest + base URL + optional API
//! key, `/api/v1/plugins/...` paths) elsewhere in this codebase, trimmed down
//! to the spec's fetch/publish contract (no install/signing/cache machinery,
//! which has no counterpart here — see DESIGN.md).

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::error::{ForgeError, ForgeResult};
use crate::model::PluginSpec;

/// Fetch-and-publish contract against a plugin marketplace. The registry
/// treats absence of a configured client as a "not configured" error rather
/// than requiring every deployment to wire one up.
#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    /// Pull a `PluginSpec` by id.
    async fn fetch(&self, id: &str) -> ForgeResult<PluginSpec>;
    /// Publish `spec`, which the caller has already validated.
    async fn publish(&self, spec: &PluginSpec) -> ForgeResult<()>;
}

/// HTTP-backed `MarketplaceClient` against `<base_url>/api/v1/plugins/...`.
pub struct HttpMarketplaceClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpMarketplaceClient {
    /// Construct a client talking to `base_url`.
    pub fn new(base_url: Url) -> ForgeResult<Self> {
        let client = Client::builder()
            .user_agent("forge-plugin/0.1.0")
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key: None,
        })
    }

    /// Attach a bearer API key to every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }
}

#[async_trait]
impl MarketplaceClient for HttpMarketplaceClient {
    async fn fetch(&self, id: &str) -> ForgeResult<PluginSpec> {
        let url = self.base_url.join(&format!("api/v1/plugins/{id}"))?;
        let response = self.authorize(self.client.get(url)).send().await?;
        if !response.status().is_success() {
            return Err(ForgeError::Other(format!(
                "marketplace fetch of '{id}' failed: {}",
                response.status()
            )));
        }
        Ok(response.json::<PluginSpec>().await?)
    }

    async fn publish(&self, spec: &PluginSpec) -> ForgeResult<()> {
        let url = self.base_url.join("api/v1/plugins")?;
        let response = self.authorize(self.client.post(url)).json(spec).send().await?;
        if !response.status().is_success() {
            return Err(ForgeError::Other(format!(
                "marketplace publish of '{}' failed: {}",
                spec.name,
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_construction_rejects_bad_base_url() {
        assert!(Url::parse("not a url").is_err());
    }

    #[test]
    fn with_api_key_is_recorded() {
        let client = HttpMarketplaceClient::new(Url::parse("https://marketplace.example").unwrap())
            .unwrap()
            .with_api_key("secret");
        assert_eq!(client.api_key.as_deref(), Some("secret"));
    }
}
