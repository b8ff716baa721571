use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

use super::{TransportError, to_setup_error};

pub const PUBLIC_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry of the credential endpoint's response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServerEntry {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerEntry {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

pub fn stun_fallback() -> Vec<IceServerEntry> {
    PUBLIC_STUN_SERVERS
        .iter()
        .map(|url| IceServerEntry::stun(url))
        .collect()
}

/// Resolves the ICE server list used for new connections.
#[derive(Debug, Clone)]
pub struct CredentialFetcher {
    endpoint: Option<String>,
    client: Client,
}

impl CredentialFetcher {
    pub fn new(endpoint: Option<String>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(to_setup_error)?;
        Ok(Self { endpoint, client })
    }

    /// Fetched TURN servers followed by the public STUN set. Never fails: any
    /// fetch or parse problem yields the STUN set alone.
    pub async fn ice_servers(&self) -> Vec<IceServerEntry> {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return stun_fallback();
        };
        match self.fetch(endpoint).await {
            Ok(mut servers) => {
                debug!(
                    target: "dbase::credentials",
                    count = servers.len(),
                    "fetched turn credentials"
                );
                servers.extend(stun_fallback());
                servers
            }
            Err(err) => {
                warn!(
                    target: "dbase::credentials",
                    error = %err,
                    "turn credential fetch failed; using public stun only"
                );
                stun_fallback()
            }
        }
    }

    async fn fetch(&self, endpoint: &str) -> Result<Vec<IceServerEntry>, TransportError> {
        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|err| TransportError::Setup(format!("credential request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(TransportError::Setup(format!(
                "credential request returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<IceServerEntry>>()
            .await
            .map_err(|err| TransportError::Setup(format!("credential response invalid: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_list_urls() {
        let body = r#"[
            {"urls": "turn:relay.example:80", "username": "u", "credential": "c"},
            {"urls": ["turn:relay.example:443?transport=tcp", "turns:relay.example:443"]}
        ]"#;
        let servers: Vec<IceServerEntry> = serde_json::from_str(body).unwrap();
        assert_eq!(servers[0].urls, vec!["turn:relay.example:80"]);
        assert_eq!(servers[1].urls.len(), 2);
        let rtc = servers[0].to_rtc();
        assert_eq!(rtc.username, "u");
        assert_eq!(rtc.credential, "c");
    }

    #[tokio::test]
    async fn no_endpoint_means_stun_only() {
        let fetcher = CredentialFetcher::new(None).unwrap();
        let servers = fetcher.ice_servers().await;
        assert_eq!(servers.len(), 5);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_back() {
        let fetcher = CredentialFetcher::new(Some("http://127.0.0.1:9/turn".into())).unwrap();
        let servers = fetcher.ice_servers().await;
        assert_eq!(servers, stun_fallback());
    }
}
