//! Testing utilities and mock implementations
//!
//! Lets the connection manager and publish loop run end to end without a
//! broker. Key fixtures live in `tests/fixtures/`.

pub mod mocks;

pub use mocks::*;

pub mod fixtures {
    use crate::auth::{CredentialIssuer, DeviceIdentity, SigningAlgorithm, DEFAULT_TOKEN_VALIDITY};
    use std::path::PathBuf;

    pub fn fixture_path(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    /// Device `pump-7` in project `test-project`, signing with the given algorithm
    pub fn test_identity(algorithm: SigningAlgorithm) -> DeviceIdentity {
        let key = match algorithm {
            SigningAlgorithm::Rs256 => "rsa_private.pem",
            SigningAlgorithm::Es256 => "ec_private.pem",
        };
        DeviceIdentity {
            project_id: "test-project".to_string(),
            location: "europe-west1".to_string(),
            registry_id: "sensors".to_string(),
            device_id: "pump-7".to_string(),
            private_key_file: fixture_path(key),
            algorithm,
        }
    }

    /// RS256 issuer with the default 20 minute validity
    ///
    /// # Panics
    /// If the key fixture is missing.
    pub fn test_issuer() -> CredentialIssuer {
        CredentialIssuer::new(test_identity(SigningAlgorithm::Rs256), DEFAULT_TOKEN_VALIDITY)
            .expect("RSA fixture key should load")
    }
}
