use serde::Deserialize;
use std::fmt;

use crate::error::ConnectionError;

/// Credential used to authenticate the connection
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    AccessToken(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credentials::AccessToken(_) => f.write_str("AccessToken(<redacted>)"),
        }
    }
}

/// Where the credential travels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPlacement {
    /// `api_key` / `access_token` query parameter
    #[default]
    Query,
    /// `X-Api-Key` / `Authorization: Bearer` header
    Header,
}

/// Optional identifiers selecting server-side configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub config_id: Option<String>,
    pub config_version: Option<u32>,
    /// Resume an earlier chat group instead of starting a new one
    pub resumed_chat_group_id: Option<String>,
    pub verbose_transcription: bool,
}

/// Everything needed to open one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub credentials: Credentials,
    pub placement: CredentialPlacement,
    pub params: SessionParams,
}

impl ConnectRequest {
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
            placement: CredentialPlacement::Query,
            params: SessionParams::default(),
        }
    }

    /// Full connection URL including query parameters
    pub fn url(&self) -> Result<String, ConnectionError> {
        let mut query = self.params_query();
        if self.placement == CredentialPlacement::Query {
            let (name, value) = self.credential_param();
            query.insert(0, (name, value.to_string()));
        }
        self.build_url(&query)
    }

    /// Connection URL with the credential masked, for logs
    pub fn redacted_url(&self) -> String {
        let mut query = self.params_query();
        if self.placement == CredentialPlacement::Query {
            let (name, _) = self.credential_param();
            query.insert(0, (name, "***".to_string()));
        }
        self.build_url(&query)
            .unwrap_or_else(|_| self.endpoint.clone())
    }

    /// Headers to attach to the handshake request
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match (self.placement, &self.credentials) {
            (CredentialPlacement::Query, _) => Vec::new(),
            (CredentialPlacement::Header, Credentials::ApiKey(key)) => {
                vec![("x-api-key", key.clone())]
            }
            (CredentialPlacement::Header, Credentials::AccessToken(token)) => {
                vec![("authorization", format!("Bearer {}", token))]
            }
        }
    }

    fn credential_param(&self) -> (&'static str, &str) {
        match &self.credentials {
            Credentials::ApiKey(key) => ("api_key", key.as_str()),
            Credentials::AccessToken(token) => ("access_token", token.as_str()),
        }
    }

    fn params_query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();

        if let Some(config_id) = &self.params.config_id {
            query.push(("config_id", config_id.clone()));
        }
        if let Some(version) = self.params.config_version {
            query.push(("config_version", version.to_string()));
        }
        if let Some(group) = &self.params.resumed_chat_group_id {
            query.push(("resumed_chat_group_id", group.clone()));
        }
        if self.params.verbose_transcription {
            query.push(("verbose_transcription", "true".to_string()));
        }

        query
    }

    fn build_url(&self, query: &[(&'static str, String)]) -> Result<String, ConnectionError> {
        let endpoint = self.endpoint.trim();
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(ConnectionError::InvalidEndpoint(format!(
                "expected ws:// or wss:// scheme, got {}",
                endpoint
            )));
        }

        if query.is_empty() {
            return Ok(endpoint.to_string());
        }

        let encoded: Vec<String> = query
            .iter()
            .map(|(name, value)| format!("{}={}", name, urlencoding::encode(value)))
            .collect();

        let separator = if endpoint.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}{}", endpoint, separator, encoded.join("&")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_credentials_and_params() {
        let mut request = ConnectRequest::new(
            "wss://api.example.com/v0/evi/chat",
            Credentials::ApiKey("k&y".to_string()),
        );
        request.params.config_id = Some("cfg 1".to_string());
        request.params.config_version = Some(3);
        request.params.resumed_chat_group_id = Some("grp".to_string());

        assert_eq!(
            request.url().unwrap(),
            "wss://api.example.com/v0/evi/chat?api_key=k%26y&config_id=cfg%201&config_version=3&resumed_chat_group_id=grp"
        );
        assert!(request.headers().is_empty());
    }

    #[test]
    fn test_header_credentials_stay_out_of_url() {
        let mut request = ConnectRequest::new(
            "ws://localhost:9000/chat?x=1",
            Credentials::AccessToken("tok".to_string()),
        );
        request.placement = CredentialPlacement::Header;
        request.params.verbose_transcription = true;

        assert_eq!(
            request.url().unwrap(),
            "ws://localhost:9000/chat?x=1&verbose_transcription=true"
        );
        assert_eq!(
            request.headers(),
            vec![("authorization", "Bearer tok".to_string())]
        );
    }

    #[test]
    fn test_redacted_url_and_debug_hide_secret() {
        let request = ConnectRequest::new("wss://h/chat", Credentials::ApiKey("secret".to_string()));
        assert_eq!(request.redacted_url(), "wss://h/chat?api_key=***");
        assert!(!format!("{:?}", request).contains("secret"));
    }

    #[test]
    fn test_rejects_non_websocket_scheme() {
        let request = ConnectRequest::new("https://h/chat", Credentials::ApiKey("k".to_string()));
        assert!(matches!(request.url(), Err(ConnectionError::InvalidEndpoint(_))));
    }
}
