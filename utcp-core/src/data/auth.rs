//! Authentication descriptors attached to call templates.
//!
//! Auth is a tagged polymorphic family: the `auth_type` discriminator picks
//! the scheme, and scheme serializers are looked up in the plugin registry
//! so external crates can contribute additional schemes. The runtime never
//! authenticates by itself; it only propagates these descriptors to the
//! transport that executes the call.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{UtcpError, UtcpResult};
use crate::interfaces::serializer::{discriminator, Serializer};
use crate::plugins;

/// One concrete authentication scheme (API key, basic, OAuth2, ...).
pub trait AuthScheme: fmt::Debug + Send + Sync + 'static {
    fn auth_type(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

/// Polymorphic handle to an [`AuthScheme`], serialized through the
/// tag-dispatched registry.
#[derive(Debug, Clone)]
pub struct Auth {
    inner: Arc<dyn AuthScheme>,
}

impl Auth {
    pub fn new<S: AuthScheme>(scheme: S) -> Self {
        Self {
            inner: Arc::new(scheme),
        }
    }

    pub fn auth_type(&self) -> &str {
        self.inner.auth_type()
    }

    pub fn downcast_ref<S: AuthScheme>(&self) -> Option<&S> {
        self.inner.as_any().downcast_ref()
    }

    pub fn to_value(&self) -> UtcpResult<Value> {
        AuthSerializer.to_value(self)
    }

    pub fn from_value(value: &Value) -> UtcpResult<Self> {
        AuthSerializer.validate_value(value)
    }
}

impl PartialEq for Auth {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_value(), other.to_value()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for Auth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.to_value().map_err(serde::ser::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Auth {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Auth::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Dispatcher serializer for the auth family.
pub struct AuthSerializer;

impl Serializer<Auth> for AuthSerializer {
    fn to_value(&self, obj: &Auth) -> UtcpResult<Value> {
        plugins::ensure_plugins_initialized();
        plugins::auth_serializer(obj.auth_type())?.to_value(obj)
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<Auth> {
        plugins::ensure_plugins_initialized();
        let tag = discriminator(value, "auth_type", "Auth")?;
        plugins::auth_serializer(tag)?.validate_value(value)
    }
}

/// Serde-backed serializer for one concrete auth scheme. Injects the
/// `auth_type` tag on the way out; serde ignores it on the way back in.
pub struct AuthVariantSerializer<S> {
    tag: &'static str,
    _marker: PhantomData<fn() -> S>,
}

impl<S> AuthVariantSerializer<S> {
    pub const fn new(tag: &'static str) -> Self {
        Self {
            tag,
            _marker: PhantomData,
        }
    }
}

impl<S> Serializer<Auth> for AuthVariantSerializer<S>
where
    S: AuthScheme + Serialize + DeserializeOwned + Clone,
{
    fn to_value(&self, obj: &Auth) -> UtcpResult<Value> {
        let scheme: &S = obj.downcast_ref().ok_or_else(|| {
            UtcpError::validation(self.tag, "auth scheme does not match its registered type")
        })?;
        let mut value =
            serde_json::to_value(scheme).map_err(|err| UtcpError::validation(self.tag, err))?;
        if let Value::Object(map) = &mut value {
            map.insert("auth_type".into(), Value::String(self.tag.into()));
        }
        Ok(value)
    }

    fn validate_value(&self, value: &Value) -> UtcpResult<Auth> {
        let scheme: S = serde_json::from_value(value.clone())
            .map_err(|err| UtcpError::validation(self.tag, err))?;
        Ok(Auth::new(scheme))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    Header,
    Query,
    Cookie,
}

/// Authentication with a static API key placed in a header, query
/// parameter or cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyAuth {
    /// The key itself. Values written as `${VAR}` or `$VAR` are resolved by
    /// the variable substitutor before the transport sees them.
    pub api_key: String,
    /// Name of the header, query parameter or cookie carrying the key.
    #[serde(default = "ApiKeyAuth::default_var_name")]
    pub var_name: String,
    #[serde(default = "ApiKeyAuth::default_location")]
    pub location: ApiKeyLocation,
}

impl ApiKeyAuth {
    pub const AUTH_TYPE: &'static str = "api_key";

    fn default_var_name() -> String {
        "X-Api-Key".into()
    }

    const fn default_location() -> ApiKeyLocation {
        ApiKeyLocation::Header
    }
}

impl AuthScheme for ApiKeyAuth {
    fn auth_type(&self) -> &str {
        Self::AUTH_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// HTTP basic authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub const AUTH_TYPE: &'static str = "basic";
}

impl AuthScheme for BasicAuth {
    fn auth_type(&self) -> &str {
        Self::AUTH_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// OAuth2 client-credentials flow. Transports cache fetched tokens per
/// client id and reuse them until expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Auth {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuth2Auth {
    pub const AUTH_TYPE: &'static str = "oauth2";
}

impl AuthScheme for OAuth2Auth {
    fn auth_type(&self) -> &str {
        Self::AUTH_TYPE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_key_round_trip() {
        let auth = Auth::new(ApiKeyAuth {
            api_key: "Bearer ${API_KEY}".into(),
            var_name: "Authorization".into(),
            location: ApiKeyLocation::Header,
        });
        let value = auth.to_value().unwrap();
        assert_eq!(value["auth_type"], "api_key");
        let back = Auth::from_value(&value).unwrap();
        assert_eq!(back, auth);
        assert_eq!(back.to_value().unwrap(), value);
    }

    #[test]
    fn api_key_defaults_apply() {
        let auth = Auth::from_value(&json!({"auth_type": "api_key", "api_key": "k"})).unwrap();
        let scheme: &ApiKeyAuth = auth.downcast_ref().unwrap();
        assert_eq!(scheme.var_name, "X-Api-Key");
        assert_eq!(scheme.location, ApiKeyLocation::Header);
    }

    #[test]
    fn basic_and_oauth2_round_trip() {
        for value in [
            json!({"auth_type": "basic", "username": "user", "password": "pass"}),
            json!({
                "auth_type": "oauth2",
                "token_url": "https://auth.example.com/token",
                "client_id": "id",
                "client_secret": "secret",
                "scope": "read:tools",
            }),
        ] {
            let auth = Auth::from_value(&value).unwrap();
            assert_eq!(auth.to_value().unwrap(), value);
        }
    }

    #[test]
    fn unknown_auth_type_is_rejected() {
        let err = Auth::from_value(&json!({"auth_type": "kerberos"})).unwrap_err();
        assert_eq!(err.code(), "UTCP_E002");
    }

    #[test]
    fn missing_discriminator_is_a_validation_error() {
        let err = Auth::from_value(&json!({"api_key": "k"})).unwrap_err();
        assert_eq!(err.code(), "UTCP_E001");
    }
}
