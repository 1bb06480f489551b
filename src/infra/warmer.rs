use std::time::Duration;

use reqwest::{Client, header::CACHE_CONTROL};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cache::PreloadQueue;

#[derive(Debug, Error)]
pub enum WarmError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to `{url}` failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("`{url}` answered with status {status}")]
    Status { url: String, status: u16 },
}

/// Result of one warm pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub warmed: usize,
    pub failed: Vec<String>,
}

/// Fetches queued URLs so the page cache captures them.
#[derive(Debug, Clone)]
pub struct PreloadWarmer {
    client: Client,
    concurrency: usize,
}

impl PreloadWarmer {
    pub fn new(user_agent: &str, timeout: Duration, concurrency: usize) -> Result<Self, WarmError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(WarmError::Client)?;
        Ok(Self {
            client,
            concurrency: concurrency.max(1),
        })
    }

    /// Drain up to `limit` URLs from the queue and fetch them.
    pub async fn run(&self, queue: &PreloadQueue, limit: usize) -> WarmReport {
        let batch = queue.take_batch(limit);
        if batch.is_empty() {
            info!(target = "pagehold::warmer", "preload queue is empty");
            return WarmReport::default();
        }
        self.warm(batch).await
    }

    pub async fn warm(&self, urls: Vec<String>) -> WarmReport {
        let mut report = WarmReport::default();

        for chunk in urls.chunks(self.concurrency) {
            let mut tasks = JoinSet::new();
            for url in chunk {
                let client = self.client.clone();
                let url = url.clone();
                tasks.spawn(async move {
                    let result = fetch(&client, &url).await;
                    (url, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((url, Ok(()))) => {
                        info!(target = "pagehold::warmer", url = %url, "warmed");
                        report.warmed += 1;
                    }
                    Ok((url, Err(err))) => {
                        warn!(target = "pagehold::warmer", url = %url, error = %err, "warm failed");
                        report.failed.push(url);
                    }
                    Err(err) => {
                        warn!(target = "pagehold::warmer", error = %err, "warm task aborted");
                    }
                }
            }
        }

        report
    }
}

async fn fetch(client: &Client, url: &str) -> Result<(), WarmError> {
    let response = client
        .get(url)
        .header(CACHE_CONTROL, "no-cache")
        .send()
        .await
        .map_err(|source| WarmError::Request {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    // Drain the body so the server finishes rendering and capturing.
    response.bytes().await.map_err(|source| WarmError::Request {
        url: url.to_string(),
        source,
    })?;

    if status.is_success() {
        Ok(())
    } else {
        Err(WarmError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}
