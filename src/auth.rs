//! Device credentials for broker authentication
//!
//! The broker does not use the MQTT username. The password is a short-lived JWT
//! whose audience is the project id, signed with the device's private key.
//! Tokens are immutable: rotation means issuing a new one.
//!
//! Nothing in this module logs key material, the encoded token or its signature.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Default token validity window (20 minutes)
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(20 * 60);

/// Signing algorithms accepted by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    #[serde(rename = "RS256")]
    Rs256,
    #[serde(rename = "ES256")]
    Es256,
}

impl SigningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::Rs256 => "RS256",
            SigningAlgorithm::Es256 => "ES256",
        }
    }

    fn jwt_algorithm(&self) -> Algorithm {
        match self {
            SigningAlgorithm::Rs256 => Algorithm::RS256,
            SigningAlgorithm::Es256 => Algorithm::ES256,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RS256" => Ok(SigningAlgorithm::Rs256),
            "ES256" => Ok(SigningAlgorithm::Es256),
            other => Err(CredentialError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Credential failures. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to read private key file {path}")]
    KeyFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Private key file {path} is not a valid {algorithm} key: {reason}")]
    InvalidKey {
        path: PathBuf,
        algorithm: SigningAlgorithm,
        reason: String,
    },
    #[error("Unsupported signing algorithm: {0} (expected RS256 or ES256)")]
    UnsupportedAlgorithm(String),
    #[error("Failed to sign {algorithm} token: {reason}")]
    Signing {
        algorithm: SigningAlgorithm,
        reason: String,
    },
}

/// Immutable device identity, created once from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub project_id: String,
    pub location: String,
    pub registry_id: String,
    pub device_id: String,
    pub private_key_file: PathBuf,
    pub algorithm: SigningAlgorithm,
}

impl DeviceIdentity {
    /// Fully qualified MQTT client id expected by the broker
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.location, self.registry_id, self.device_id
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
}

/// A signed authentication token
#[derive(Clone, PartialEq)]
pub struct AuthToken {
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    audience: String,
    encoded: String,
}

impl AuthToken {
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// The encoded JWT, used only as the MQTT password
    pub fn as_password(&self) -> &str {
        &self.encoded
    }

    /// Time from issue after which the token should be replaced.
    /// Always strictly shorter than the validity window.
    pub fn rotate_after(&self, margin: Duration) -> Duration {
        let validity = (self.expires_at - self.issued_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        validity
            .saturating_sub(margin)
            .max(Duration::from_secs(1))
            .min(validity.saturating_sub(Duration::from_millis(1)))
    }

    /// True once `now` has reached the rotation threshold
    pub fn is_stale(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let threshold = ChronoDuration::from_std(self.rotate_after(margin))
            .unwrap_or_else(|_| ChronoDuration::zero());
        now >= self.issued_at + threshold
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("audience", &self.audience)
            .field("encoded", &"<redacted>")
            .finish()
    }
}

/// Signs short-lived tokens from the device private key.
///
/// The key is read and parsed once in [`CredentialIssuer::new`] so that a bad
/// key aborts startup instead of surfacing on the first reconnect.
pub struct CredentialIssuer {
    identity: DeviceIdentity,
    key: EncodingKey,
    validity: Duration,
}

impl CredentialIssuer {
    pub fn new(identity: DeviceIdentity, validity: Duration) -> Result<Self, CredentialError> {
        let key = load_encoding_key(&identity.private_key_file, identity.algorithm)?;
        Ok(Self {
            identity,
            key,
            validity,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Issue a token valid from `now` for the configured window
    pub fn issue(&self, now: DateTime<Utc>) -> Result<AuthToken, CredentialError> {
        let algorithm = self.identity.algorithm;
        let validity =
            ChronoDuration::from_std(self.validity).map_err(|e| CredentialError::Signing {
                algorithm,
                reason: format!("validity window out of range: {e}"),
            })?;
        let expires_at = now
            .checked_add_signed(validity)
            .ok_or_else(|| CredentialError::Signing {
                algorithm,
                reason: format!("expiry {:?} after {now} is out of range", self.validity),
            })?;

        let claims = TokenClaims {
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            aud: self.identity.project_id.clone(),
        };

        info!(
            algorithm = %algorithm,
            key_file = %self.identity.private_key_file.display(),
            "Creating JWT from private key file"
        );

        let encoded = encode(&Header::new(algorithm.jwt_algorithm()), &claims, &self.key)
            .map_err(|e| CredentialError::Signing {
                algorithm,
                reason: e.to_string(),
            })?;

        Ok(AuthToken {
            issued_at: now,
            expires_at,
            audience: claims.aud,
            encoded,
        })
    }
}

fn load_encoding_key(path: &Path, algorithm: SigningAlgorithm) -> Result<EncodingKey, CredentialError> {
    let pem = std::fs::read(path).map_err(|source| CredentialError::KeyFileRead {
        path: path.to_path_buf(),
        source,
    })?;

    let key = match algorithm {
        SigningAlgorithm::Rs256 => EncodingKey::from_rsa_pem(&pem),
        SigningAlgorithm::Es256 => EncodingKey::from_ec_pem(&pem),
    };

    key.map_err(|e| CredentialError::InvalidKey {
        path: path.to_path_buf(),
        algorithm,
        reason: e.to_string(),
    })
}
