use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::FetchError;
use crate::host::Fetcher;

/// [`Fetcher`] on top of a `reqwest` client.
///
/// Requests carry the `X-Requested-With` header PJAX backends use to tell a
/// soft navigation apart from a full page load.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| FetchError::Network(String::from("<client>"), err.into()))?;

        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &Url) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .header("X-Requested-With", "XMLHttpRequest")
            .header(reqwest::header::ACCEPT, "text/html")
            .send()
            .await
            .map_err(|err| FetchError::Network(url.to_string(), err.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(url.to_string(), status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|err| FetchError::Network(url.to_string(), err.into()))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<String, FetchError>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FetchError::Cancelled(url.to_string())),
                result = self.get(url) => result,
            }
        })
    }
}
