//! Liveness probe against the server's `/health` endpoint.

use std::time::Duration;

use log::debug;
use url::Url;

/// Probes `GET /health`. A 200 response means healthy; anything else,
/// including a timeout, means unhealthy.
#[derive(Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn is_healthy(&self, base_url: &Url) -> bool {
        let url = match base_url.join("health") {
            Ok(url) => url,
            Err(e) => {
                debug!("[health] Bad base url {}: {}", base_url, e);
                return false;
            }
        };
        match self.client.get(url.clone()).send().await {
            Ok(response) => {
                let healthy = response.status() == reqwest::StatusCode::OK;
                if !healthy {
                    debug!("[health] {} returned {}", url, response.status());
                }
                healthy
            }
            Err(e) => {
                debug!("[health] {} unreachable: {}", url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_port_is_unhealthy() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = HealthProbe::new(Duration::from_millis(300)).unwrap();
        let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        assert!(!probe.is_healthy(&url).await);
    }
}
