use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use camino::Utf8PathBuf;
use cfg_if::cfg_if;
use picky::key::PublicKey;
use secrecy::SecretString;
use tokio::sync::Notify;

use crate::approval::DEFAULT_APPROVAL_TIMEOUT;
use crate::connection::DEFAULT_HEARTBEAT_INTERVAL;
use crate::listener::ListenerUrls;

cfg_if! {
    if #[cfg(target_os = "windows")] {
        const APPLICATION_DIR: &str = "Fleet\\Gateway";
    } else if #[cfg(target_os = "macos")] {
        const APPLICATION_DIR: &str = "Fleet Gateway";
    } else {
        const APPLICATION_DIR: &str = "fleet-gateway";
    }
}

pub mod dto {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ListenerConf {
        #[serde(rename = "InternalUrl")]
        pub internal_url: url::Url,
        #[serde(rename = "ExternalUrl")]
        pub external_url: url::Url,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct DebugConf {
        #[serde(default)]
        pub disable_token_validation: bool,
    }

    impl DebugConf {
        pub fn is_default(&self) -> bool {
            !self.disable_token_validation
        }
    }

    /// On-disk configuration file.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ConfFile {
        #[serde(rename = "Id", skip_serializing_if = "Option::is_none")]
        pub id: Option<uuid::Uuid>,
        #[serde(rename = "Hostname", skip_serializing_if = "Option::is_none")]
        pub hostname: Option<String>,
        #[serde(rename = "Listeners", default)]
        pub listeners: Vec<ListenerConf>,
        /// Base64 DER or PEM public key of the customer token issuer.
        #[serde(rename = "IssuerPublicKeyData", skip_serializing_if = "Option::is_none")]
        pub issuer_public_key_data: Option<String>,
        #[serde(rename = "IssuerPublicKeyFile", skip_serializing_if = "Option::is_none")]
        pub issuer_public_key_file: Option<Utf8PathBuf>,
        #[serde(rename = "SigningKeyFile", skip_serializing_if = "Option::is_none")]
        pub signing_key_file: Option<Utf8PathBuf>,
        #[serde(rename = "InternalAuthToken", skip_serializing_if = "Option::is_none")]
        pub internal_auth_token: Option<String>,
        #[serde(rename = "LogFile", skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,
        #[serde(rename = "LogDirective", skip_serializing_if = "Option::is_none")]
        pub log_directive: Option<String>,
        #[serde(rename = "ApprovalTimeoutSecs", skip_serializing_if = "Option::is_none")]
        pub approval_timeout_secs: Option<u64>,
        #[serde(rename = "HeartbeatIntervalSecs", skip_serializing_if = "Option::is_none")]
        pub heartbeat_interval_secs: Option<u64>,
        #[serde(rename = "__debug__", default, skip_serializing_if = "DebugConf::is_default")]
        pub debug: DebugConf,
    }
}

/// Runtime configuration assembled from the configuration file.
#[derive(Debug)]
pub struct Conf {
    pub id: Option<uuid::Uuid>,
    pub hostname: String,
    pub listeners: Vec<ListenerUrls>,
    pub issuer_public_key: Option<PublicKey>,
    pub signing_key_path: Utf8PathBuf,
    pub internal_auth_token: Option<SecretString>,
    pub log_file: Utf8PathBuf,
    pub log_directive: Option<String>,
    pub approval_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub debug: dto::DebugConf,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let data_dir = get_data_dir();

        let hostname = conf_file
            .hostname
            .clone()
            .unwrap_or_else(|| default_hostname().unwrap_or_else(|| "fleet-gateway".to_owned()));

        let listeners: Vec<ListenerUrls> = conf_file
            .listeners
            .iter()
            .map(|listener| ListenerUrls {
                internal_url: listener.internal_url.clone(),
                external_url: listener.external_url.clone(),
            })
            .collect();

        anyhow::ensure!(!listeners.is_empty(), "at least one listener is required");

        let issuer_public_key = conf_file
            .issuer_public_key_data
            .as_deref()
            .map(parse_public_key)
            .or_else(|| {
                conf_file.issuer_public_key_file.as_ref().map(|path| {
                    std::fs::read_to_string(path)
                        .with_context(|| format!("couldn't read issuer key at {path}"))
                        .and_then(|pem| parse_public_key(&pem))
                })
            })
            .transpose()
            .context("invalid issuer public key")?;

        let signing_key_path = conf_file
            .signing_key_file
            .clone()
            .unwrap_or_else(|| data_dir.join("signing-key.pem"));

        let log_file = conf_file.log_file.clone().unwrap_or_else(|| data_dir.join("gateway.log"));

        Ok(Conf {
            id: conf_file.id,
            hostname,
            listeners,
            issuer_public_key,
            signing_key_path,
            internal_auth_token: conf_file.internal_auth_token.clone().map(SecretString::from),
            log_file,
            log_directive: conf_file.log_directive.clone(),
            approval_timeout: conf_file
                .approval_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_APPROVAL_TIMEOUT),
            heartbeat_interval: conf_file
                .heartbeat_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
            debug: conf_file.debug.clone(),
        })
    }
}

fn parse_public_key(data: &str) -> anyhow::Result<PublicKey> {
    if data.contains("-----BEGIN") {
        PublicKey::from_pem_str(data).context("invalid public key PEM")
    } else {
        let der = BASE64.decode(data.trim()).context("invalid base64 public key")?;
        PublicKey::from_der(&der).context("invalid DER public key")
    }
}

fn default_hostname() -> Option<String> {
    env::var("HOSTNAME").ok().filter(|name| !name.is_empty())
}

/// Configuration handle, source of truth for current configuration state.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

struct ConfHandleInner {
    conf: parking_lot::RwLock<Arc<Conf>>,
    conf_file: parking_lot::RwLock<Arc<dto::ConfFile>>,
    changed: Notify,
}

impl ConfHandle {
    /// Initializes configuration for this instance.
    ///
    /// It's best to call this only once to avoid inconsistencies.
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new()?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self::from_parts(conf, conf_file))
    }

    #[doc(hidden)]
    pub fn mock(json_config: &str) -> anyhow::Result<Self> {
        let conf_file = serde_json::from_str::<dto::ConfFile>(json_config).context("invalid JSON config")?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self::from_parts(conf, conf_file))
    }

    fn from_parts(conf: Conf, conf_file: dto::ConfFile) -> Self {
        Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
                changed: Notify::new(),
            }),
        }
    }

    /// Returns current configuration state (do not hold it forever as it may become outdated).
    pub fn get_conf(&self) -> Arc<Conf> {
        self.inner.conf.read().clone()
    }

    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        self.inner.conf_file.read().clone()
    }

    /// Waits for configuration to be changed.
    pub async fn change_notified(&self) {
        self.inner.changed.notified().await;
    }
}

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(config_path_env) = env::var("FGATEWAY_CONFIG_PATH") {
        Utf8PathBuf::from(config_path_env)
    } else {
        cfg_if! {
            if #[cfg(target_os = "windows")] {
                let mut dir = Utf8PathBuf::from(env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_owned()));
                dir.push(APPLICATION_DIR);
                dir
            } else if #[cfg(target_os = "macos")] {
                let mut dir = Utf8PathBuf::from("/Library/Application Support");
                dir.push(APPLICATION_DIR);
                dir
            } else {
                let mut dir = Utf8PathBuf::from("/etc");
                dir.push(APPLICATION_DIR);
                dir
            }
        }
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    get_data_dir().join("gateway.json")
}

pub fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let conf_file_path = get_conf_file_path();

    if conf_file_path.exists() {
        let json = std::fs::read_to_string(&conf_file_path)
            .with_context(|| format!("couldn't read config file at {conf_file_path}"))?;
        serde_json::from_str(&json).context("invalid config file")
    } else {
        info!(path = %conf_file_path, "Config file doesn't exist, generating a default one");

        let defaults = dto::ConfFile {
            listeners: vec![dto::ListenerConf {
                internal_url: "http://*:7171".parse().expect("valid default URL"),
                external_url: "http://*:7171".parse().expect("valid default URL"),
            }],
            ..Default::default()
        };

        if let Some(parent) = conf_file_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("couldn't create config directory {parent}"))?;
        }

        let json = serde_json::to_string_pretty(&defaults).context("default config serialization")?;
        std::fs::write(&conf_file_path, json)
            .with_context(|| format!("couldn't write config file at {conf_file_path}"))?;

        Ok(defaults)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mock_config_applies_defaults() {
        let handle = ConfHandle::mock(
            r#"{
                "Hostname": "gw-test",
                "Listeners": [
                    { "InternalUrl": "http://*:7171", "ExternalUrl": "http://*:7171" }
                ],
                "__debug__": { "disable_token_validation": true }
            }"#,
        )
        .unwrap();

        let conf = handle.get_conf();
        assert_eq!(conf.hostname, "gw-test");
        assert_eq!(conf.approval_timeout, DEFAULT_APPROVAL_TIMEOUT);
        assert_eq!(conf.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert!(conf.debug.disable_token_validation);
        assert!(conf.issuer_public_key.is_none());
    }

    #[test]
    fn config_without_listeners_is_rejected() {
        let result = ConfHandle::mock(r#"{ "Hostname": "gw-test" }"#);
        assert!(result.is_err());
    }
}
