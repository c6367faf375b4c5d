//! Liveness probing of HTTP endpoints.

use async_trait::async_trait;

/// Answers whether an endpoint is up.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Returns true if `url` answers with HTTP 200. Errors count as "not up".
    async fn is_alive(&self, url: &str) -> bool;
}

#[cfg(feature = "http-probe")]
pub use http::HttpLivenessProbe;

#[cfg(feature = "http-probe")]
mod http {
    use super::LivenessProbe;
    use crate::errors::{BuildflowError, BuildflowResult};
    use async_trait::async_trait;
    use std::time::Duration;
    use tracing::debug;

    /// Probes endpoints with a short-timeout HTTP GET.
    #[derive(Debug, Clone)]
    pub struct HttpLivenessProbe {
        client: reqwest::Client,
    }

    impl HttpLivenessProbe {
        /// Connect timeout.
        pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
        /// Whole-request timeout.
        pub const READ_TIMEOUT: Duration = Duration::from_millis(2000);

        /// Creates a probe with the default timeouts.
        pub fn new() -> BuildflowResult<Self> {
            let client = reqwest::Client::builder()
                .connect_timeout(Self::CONNECT_TIMEOUT)
                .timeout(Self::READ_TIMEOUT)
                .build()
                .map_err(|e| BuildflowError::Config(format!("cannot build HTTP client: {e}")))?;
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl LivenessProbe for HttpLivenessProbe {
        async fn is_alive(&self, url: &str) -> bool {
            match self.client.get(url).send().await {
                Ok(response) => {
                    debug!(url = %url, status = %response.status(), "Liveness probe answered");
                    response.status() == reqwest::StatusCode::OK
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Liveness probe failed");
                    false
                }
            }
        }
    }

}
