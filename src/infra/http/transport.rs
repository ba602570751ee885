//! Farm transport over HTTP.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};
use url::Url;

use crate::cache::FarmConfig;
use crate::cache::TransportError;
use crate::cache::messenger::{FarmTransport, MessageEnvelope};
use crate::infra::error::InfraError;

use super::INSTRUCTIONS_PATH;

/// Posts envelopes as JSON to every peer's instruction endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: Vec<Url>,
}

impl HttpTransport {
    pub fn new(config: &FarmConfig) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(InfraError::http_client)?;
        let endpoints = config
            .peers
            .iter()
            .map(instructions_endpoint)
            .collect::<Result<Vec<_>, _>>()
            .map_err(InfraError::http_client)?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    async fn post(&self, endpoint: &Url, body: Bytes) -> Result<(), TransportError> {
        let response = self
            .client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| TransportError::request(endpoint.as_str(), err))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                peer: endpoint.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

/// `peer` joined with the instruction route.
///
/// The peer path is treated as a directory whether or not it ends in `/`,
/// so `http://host/app` posts to `http://host/app/cache/instructions`.
pub fn instructions_endpoint(peer: &Url) -> Result<Url, url::ParseError> {
    directory_url(peer).join(INSTRUCTIONS_PATH.trim_start_matches('/'))
}

fn directory_url(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[async_trait]
impl FarmTransport for HttpTransport {
    /// Fails only when no peer accepted the envelope.
    async fn send(&self, envelope: &MessageEnvelope) -> Result<usize, TransportError> {
        let body = Bytes::from(serde_json::to_vec(envelope)?);
        let results = join_all(
            self.endpoints
                .iter()
                .map(|endpoint| self.post(endpoint, body.clone())),
        )
        .await;

        let mut accepted = 0;
        let mut first_error = None;
        for (endpoint, result) in self.endpoints.iter().zip(results) {
            match result {
                Ok(()) => {
                    accepted += 1;
                    debug!(peer = %endpoint, envelope_id = %envelope.id, "Envelope accepted");
                }
                Err(err) => {
                    warn!(peer = %endpoint, envelope_id = %envelope.id, error = %err, "Peer rejected envelope");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) if accepted == 0 => Err(err),
            _ => Ok(accepted),
        }
    }

    fn has_peers(&self) -> bool {
        !self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_joined_under_the_peer_root() {
        let peer = Url::parse("http://web-2:8080").expect("url");
        assert_eq!(
            instructions_endpoint(&peer).expect("join").as_str(),
            "http://web-2:8080/cache/instructions"
        );

        let nested = Url::parse("https://edge.example/site/").expect("url");
        assert_eq!(
            instructions_endpoint(&nested).expect("join").as_str(),
            "https://edge.example/site/cache/instructions"
        );

        let bare = Url::parse("https://edge.example/site").expect("url");
        assert_eq!(
            instructions_endpoint(&bare).expect("join").as_str(),
            "https://edge.example/site/cache/instructions"
        );
    }

    #[test]
    fn transport_without_peers_has_nothing_to_send_to() {
        let transport = HttpTransport::new(&FarmConfig::single_server("solo")).expect("client");
        assert!(!transport.has_peers());
    }

    #[tokio::test]
    async fn unreachable_peer_fails_the_send() {
        let config = FarmConfig {
            peers: vec![Url::parse("http://127.0.0.1:9").expect("url")],
            request_timeout: std::time::Duration::from_millis(200),
            ..FarmConfig::single_server("web-1")
        };
        let transport = HttpTransport::new(&config).expect("client");
        let envelope = MessageEnvelope::new("web-1", Vec::new());
        let err = transport.send(&envelope).await.expect_err("no listener");
        assert!(matches!(err, TransportError::Request { .. }));
    }
}
