//! Failover provider: wraps multiple providers in priority order.
//!
//! When a provider fails to start a stream (rate limit, auth failure, network),
//! the next provider in the list is tried.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{CompletionRequest, CompletionStream, Credentials, LlmProvider};

/// A failover provider that tries multiple underlying providers in order.
pub struct FailoverProvider {
    providers: Vec<(Arc<dyn LlmProvider>, Credentials)>,
    label: String,
}

impl FailoverProvider {
    /// The first provider is primary; others are fallbacks. Each carries its own credentials.
    pub fn new(label: String, providers: Vec<(Arc<dyn LlmProvider>, Credentials)>) -> Self {
        Self { providers, label }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    fn id(&self) -> &str {
        &self.label
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        _credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream> {
        let mut last_error = None;

        for (i, (provider, creds)) in self.providers.iter().enumerate() {
            match provider.stream(request, creds).await {
                Ok(stream) => {
                    if i > 0 {
                        info!(provider = provider.id(), attempt = i + 1, "Failover succeeded");
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(provider = provider.id(), attempt = i + 1, %e, "Provider failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("No providers configured in failover")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompletionChunk;
    use futures::StreamExt;

    struct FixedProvider {
        id: &'static str,
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl LlmProvider for FixedProvider {
        fn id(&self) -> &str {
            self.id
        }

        async fn stream(
            &self,
            _request: &CompletionRequest,
            _credentials: &Credentials,
        ) -> anyhow::Result<CompletionStream> {
            match self.reply {
                Some(text) => {
                    let chunk = CompletionChunk {
                        delta: Some(text.to_string()),
                        ..Default::default()
                    };
                    Ok(Box::pin(futures::stream::iter(vec![Ok::<_, anyhow::Error>(chunk)])))
                }
                None => anyhow::bail!("{} unavailable", self.id),
            }
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages: vec![crate::ChatMessage::user("hi")],
            max_tokens: 16,
            temperature: None,
            system: None,
        }
    }

    fn entry(id: &'static str, reply: Option<&'static str>) -> (Arc<dyn LlmProvider>, Credentials) {
        (Arc::new(FixedProvider { id, reply }), creds())
    }

    fn creds() -> Credentials {
        Credentials::ApiKey {
            api_key: "k".into(),
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_next_provider() {
        let provider = FailoverProvider::new(
            "chain".into(),
            vec![
                entry("a", None),
                entry("b", Some("from b")),
            ],
        );
        let mut stream = provider.stream(&request(), &creds()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delta.as_deref(), Some("from b"));
    }

    #[tokio::test]
    async fn test_all_fail_returns_last_error() {
        let provider = FailoverProvider::new(
            "chain".into(),
            vec![
                entry("a", None),
                entry("b", None),
            ],
        );
        let err = provider.complete(&request(), &creds()).await.unwrap_err();
        assert!(err.to_string().contains("b unavailable"));
    }

    #[tokio::test]
    async fn test_empty_failover_errors() {
        let provider = FailoverProvider::new("empty".into(), vec![]);
        assert!(provider.is_empty());
        assert!(provider.stream(&request(), &creds()).await.is_err());
    }
}
