use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// Modulemd retrieval failures. All of these drop the event being handled;
/// the service keeps running.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("modulemd request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid MBS API URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("MBS has no build for {nsvc}")]
    NoSuchBuild { nsvc: String },
    #[error("MBS build record for {nsvc} carries no modulemd")]
    MissingModulemd { nsvc: String },
}

/// Where modulemd documents come from. The production implementation talks
/// to the Module Build Service; tests substitute a canned source.
#[async_trait]
pub trait ModulemdSource {
    async fn fetch_modulemd(
        &self,
        name: &str,
        stream: &str,
        version: &str,
        context: &str,
    ) -> Result<String, RetrievalError>;
}

/// Client for the MBS REST API.
pub struct MbsClient {
    api_url: Url,
    client: reqwest::Client,
}

impl MbsClient {
    pub fn new(api_url: &str) -> Result<Self, RetrievalError> {
        // Url::join treats a base without a trailing slash as a file and
        // would replace the last path segment.
        let mut api_url = api_url.to_string();
        if !api_url.ends_with('/') {
            api_url.push('/');
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("module-tagger/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(MbsClient {
            api_url: Url::parse(&api_url)?,
            client,
        })
    }

    fn module_builds_url(
        &self,
        name: &str,
        stream: &str,
        version: &str,
        context: &str,
    ) -> Result<Url, RetrievalError> {
        let mut url = self.api_url.join("module-builds/")?;
        url.query_pairs_mut()
            .append_pair("name", name)
            .append_pair("stream", stream)
            .append_pair("version", version)
            .append_pair("context", context)
            .append_pair("verbose", "true");
        Ok(url)
    }
}

#[async_trait]
impl ModulemdSource for MbsClient {
    async fn fetch_modulemd(
        &self,
        name: &str,
        stream: &str,
        version: &str,
        context: &str,
    ) -> Result<String, RetrievalError> {
        let url = self.module_builds_url(name, stream, version, context)?;
        log::debug!("Fetching modulemd from {url}");
        let response = self.client.get(url).send().await?.error_for_status()?;
        let body: serde_json::Value = response.json().await?;

        let nsvc = format!("{name}-{stream}-{version}-{context}");
        let item = body
            .get("items")
            .and_then(|items| items.get(0))
            .ok_or_else(|| RetrievalError::NoSuchBuild { nsvc: nsvc.clone() })?;
        item.get("modulemd")
            .and_then(|modulemd| modulemd.as_str())
            .map(str::to_string)
            .ok_or(RetrievalError::MissingModulemd { nsvc })
    }
}
