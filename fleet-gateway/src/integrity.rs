//! Script package integrity.
//!
//! Script-execution bundles exchanged with devices are checksummed and
//! signed with a persistent server keypair. The keypair is loaded once at
//! startup and survives process restarts, so a package produced by one
//! service instance verifies under any other.

use std::collections::BTreeMap;

use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use camino::Utf8Path;
use picky::hash::HashAlgorithm;
use picky::key::{PrivateKey, PublicKey};
use picky::signature::SignatureAlgorithm;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use time::OffsetDateTime;

const SIGNATURE_ALGORITHM: SignatureAlgorithm = SignatureAlgorithm::RsaPkcs1v15(HashAlgorithm::SHA2_256);

const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptManifest {
    pub interpreter: String,
    pub timeout_secs: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptPackage {
    pub id: String,
    /// Base64-encoded script body.
    pub script: String,
    pub manifest: ScriptManifest,
    /// Hex SHA-256 over the raw script bytes.
    pub checksum: String,
    /// Base64 signature over the canonical package bytes; absent means the
    /// package never verifies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub struct ScriptSigner {
    private_key: PrivateKey,
    public_key: PublicKey,
}

impl ScriptSigner {
    /// Loads the persistent signing keypair, generating and writing one on
    /// first start. Regenerating on every boot would break package
    /// verification across independent service instances.
    pub fn load_or_generate(key_path: &Utf8Path) -> anyhow::Result<Self> {
        let private_key = if key_path.exists() {
            let pem = std::fs::read_to_string(key_path)
                .with_context(|| format!("couldn't read signing key at {key_path}"))?;
            PrivateKey::from_pem_str(&pem).context("invalid signing key PEM")?
        } else {
            info!(path = %key_path, "No signing key found, generating a new RSA keypair");

            let key = PrivateKey::generate_rsa(RSA_KEY_BITS).context("RSA key generation failed")?;
            let pem = key.to_pem_str().context("couldn't encode signing key as PEM")?;

            if let Some(parent) = key_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("couldn't create key directory {parent}"))?;
            }
            std::fs::write(key_path, pem).with_context(|| format!("couldn't write signing key at {key_path}"))?;

            key
        };

        let public_key = private_key.to_public_key().context("couldn't derive public key")?;

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Builds a signer around an existing key, for callers that manage key
    /// material themselves.
    pub fn from_private_key(private_key: PrivateKey) -> anyhow::Result<Self> {
        let public_key = private_key.to_public_key().context("couldn't derive public key")?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Packages a script: id, checksum, then a signature over the canonical
    /// bytes of {id, script, manifest, checksum}.
    pub fn package(
        &self,
        script: &[u8],
        manifest: ScriptManifest,
        approval_id: Option<String>,
    ) -> anyhow::Result<ScriptPackage> {
        use rand::RngCore as _;

        let mut id_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let id = format!("pkg_{}", hex::encode(id_bytes));

        let script_b64 = BASE64.encode(script);
        let checksum = hex::encode(Sha256::digest(script));

        let payload = canonical_signing_bytes(&id, &script_b64, &manifest, &checksum)?;
        let signature = SIGNATURE_ALGORITHM
            .sign(&payload, &self.private_key)
            .context("couldn't sign script package")?;

        Ok(ScriptPackage {
            id,
            script: script_b64,
            manifest,
            checksum,
            signature: Some(BASE64.encode(signature)),
            approval_id,
            created_at: OffsetDateTime::now_utc(),
        })
    }

    /// Strict signature check; a package without a signature is invalid.
    pub fn verify_signature(&self, package: &ScriptPackage) -> bool {
        let Some(signature_b64) = package.signature.as_deref() else {
            return false;
        };

        let Ok(signature) = BASE64.decode(signature_b64) else {
            return false;
        };

        let Ok(payload) =
            canonical_signing_bytes(&package.id, &package.script, &package.manifest, &package.checksum)
        else {
            return false;
        };

        SIGNATURE_ALGORITHM
            .verify(&self.public_key, &payload, &signature)
            .is_ok()
    }

    /// Recomputes the script checksum and compares.
    pub fn verify_checksum(package: &ScriptPackage) -> bool {
        let Ok(script) = BASE64.decode(&package.script) else {
            return false;
        };

        hex::encode(Sha256::digest(script)) == package.checksum
    }

    /// Base64 DER export of the verification key; stable across instances.
    pub fn public_key_base64(&self) -> anyhow::Result<String> {
        let der = self.public_key.to_der().context("couldn't encode public key")?;
        Ok(BASE64.encode(der))
    }
}

/// Canonical byte representation signed into every package.
///
/// serde_json maps are ordered, so serializing the composite object yields
/// deterministic bytes as long as the manifest round-trips through `Value`.
fn canonical_signing_bytes(
    id: &str,
    script_b64: &str,
    manifest: &ScriptManifest,
    checksum: &str,
) -> anyhow::Result<Vec<u8>> {
    let manifest_value = serde_json::to_value(manifest).context("manifest serialization failed")?;

    let composite: Value = json!({
        "checksum": checksum,
        "id": id,
        "manifest": manifest_value,
        "script": script_b64,
    });

    serde_json::to_vec(&composite).context("canonical serialization failed")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn manifest() -> ScriptManifest {
        ScriptManifest {
            interpreter: "bash".to_owned(),
            timeout_secs: 30,
            capabilities: vec!["network".to_owned()],
            env: BTreeMap::from([("LANG".to_owned(), "C".to_owned())]),
            working_dir: None,
            retry: None,
        }
    }

    fn signer() -> ScriptSigner {
        // Key generation is expensive; tests share one keypair.
        static TEST_KEY: std::sync::LazyLock<PrivateKey> =
            std::sync::LazyLock::new(|| PrivateKey::generate_rsa(RSA_KEY_BITS).expect("RSA key generation"));

        ScriptSigner::from_private_key(TEST_KEY.clone()).unwrap()
    }

    #[test]
    fn package_then_verify_round_trip() {
        let signer = signer();

        let package = signer.package(b"echo hello", manifest(), None).unwrap();

        assert!(package.id.starts_with("pkg_"));
        assert_eq!(package.id.len(), "pkg_".len() + 32);
        assert!(signer.verify_signature(&package));
        assert!(ScriptSigner::verify_checksum(&package));
    }

    #[test]
    fn tampered_script_fails_both_checks() {
        let signer = signer();

        let mut package = signer.package(b"echo hello", manifest(), None).unwrap();
        package.script = BASE64.encode(b"echo pwned");

        assert!(!signer.verify_signature(&package));
        assert!(!ScriptSigner::verify_checksum(&package));
    }

    #[test]
    fn tampered_checksum_fails_signature() {
        let signer = signer();

        let mut package = signer.package(b"echo hello", manifest(), None).unwrap();
        package.checksum = hex::encode(Sha256::digest(b"echo pwned"));

        assert!(!signer.verify_signature(&package));
        assert!(!ScriptSigner::verify_checksum(&package));
    }

    #[test]
    fn missing_or_corrupt_signature_fails() {
        let signer = signer();

        let mut package = signer.package(b"echo hello", manifest(), None).unwrap();
        package.signature = None;
        assert!(!signer.verify_signature(&package));

        package.signature = Some(BASE64.encode(b"garbage"));
        assert!(!signer.verify_signature(&package));
    }

    #[test]
    fn keypair_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = camino::Utf8PathBuf::from_path_buf(dir.path().join("signing-key.pem")).unwrap();

        let instance_a = ScriptSigner::load_or_generate(&key_path).unwrap();
        let package = instance_a.package(b"echo hello", manifest(), None).unwrap();
        drop(instance_a);

        let instance_b = ScriptSigner::load_or_generate(&key_path).unwrap();

        assert!(instance_b.verify_signature(&package));
        assert!(ScriptSigner::verify_checksum(&package));
        assert_eq!(
            ScriptSigner::load_or_generate(&key_path).unwrap().public_key_base64().unwrap(),
            instance_b.public_key_base64().unwrap()
        );
    }
}
