use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Length of the correlation token attached to every outbound request.
pub const CORRELATION_TOKEN_LEN: usize = 16;

/// Method name used by the venue for authentication.
pub const LOGIN_METHOD: &str = "login";

const LOGIN_ALGO_BASIC: &str = "BASIC";

/// Outbound subscribe envelope.
///
/// Field order is part of the wire contract: `method`, `id`, `params`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeRequest {
    pub method: String,
    pub id: String,
    pub params: Value,
}

impl SubscribeRequest {
    /// Builds a request with a fresh correlation token.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            id: correlation_token(),
            params,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decoded inbound frame.
///
/// Responses to requests carry `id`/`result` and no `method`; they decode
/// fine and are discarded by the router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl InboundEnvelope {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Routing key of this envelope, if any.
    pub fn routing_key(&self) -> Option<&str> {
        self.method.as_deref()
    }
}

/// Venue login credentials.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub login: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: SecretString) -> Self {
        Self {
            login: login.into(),
            password,
        }
    }

    /// Wire parameters for the `login` subscription.
    pub fn login_params(&self) -> LoginParams {
        LoginParams {
            algo: LOGIN_ALGO_BASIC.to_string(),
            p_key: self.login.clone(),
            s_key: self.password.expose_secret().clone(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginParams {
    pub algo: String,
    #[serde(rename = "pKey")]
    pub p_key: String,
    #[serde(rename = "sKey")]
    pub s_key: String,
}

impl std::fmt::Debug for LoginParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginParams")
            .field("algo", &self.algo)
            .field("p_key", &self.p_key)
            .field("s_key", &"[REDACTED]")
            .finish()
    }
}

/// Generates a random alphanumeric correlation token.
pub fn correlation_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CORRELATION_TOKEN_LEN)
        .map(char::from)
        .collect()
}
