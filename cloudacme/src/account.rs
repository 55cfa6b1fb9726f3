//! ACME account key storage
//!
//! The account is persisted as the JSON-encoded credentials `instant-acme`
//! produces when an account is created. They live either in a local file or
//! in an SSM SecureString parameter.

use async_trait::async_trait;
use aws_sdk_ssm::error::DisplayErrorContext;
use aws_sdk_ssm::types::ParameterType;
use instant_acme::{Account, AccountCredentials, NewAccount};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("account key not found")]
    NotFound,

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parameter store error: {0}")]
    Api(String),
}

#[async_trait]
pub trait AccountKeyStore: Send + Sync {
    /// Stored key bytes, or [`KeyStoreError::NotFound`].
    async fn load(&self) -> Result<Vec<u8>, KeyStoreError>;

    async fn save(&self, key: &[u8]) -> Result<(), KeyStoreError>;

    /// Where the key lives, for logs and errors.
    fn location(&self) -> String;
}

pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: std::io::Error) -> KeyStoreError {
        KeyStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl AccountKeyStore for FileKeyStore {
    async fn load(&self) -> Result<Vec<u8>, KeyStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(KeyStoreError::NotFound),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn save(&self, key: &[u8]) -> Result<(), KeyStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        tokio::fs::write(&self.path, key)
            .await
            .map_err(|e| self.io_error(e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| self.io_error(e))?;
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Key kept in an SSM SecureString parameter
pub struct SsmKeyStore {
    client: aws_sdk_ssm::Client,
    name: String,
}

impl SsmKeyStore {
    pub fn new(config: &aws_config::SdkConfig, name: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_ssm::Client::new(config),
            name: name.into(),
        }
    }
}

#[async_trait]
impl AccountKeyStore for SsmKeyStore {
    async fn load(&self) -> Result<Vec<u8>, KeyStoreError> {
        let result = self
            .client
            .get_parameter()
            .name(&self.name)
            .with_decryption(true)
            .send()
            .await;

        match result {
            Ok(output) => output
                .parameter()
                .and_then(|p| p.value())
                .map(|v| v.as_bytes().to_vec())
                .ok_or_else(|| KeyStoreError::Api(format!("parameter {} has no value", self.name))),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_parameter_not_found()) =>
            {
                Err(KeyStoreError::NotFound)
            }
            Err(err) => Err(KeyStoreError::Api(format!(
                "GetParameter {}: {}",
                self.name,
                DisplayErrorContext(err)
            ))),
        }
    }

    async fn save(&self, key: &[u8]) -> Result<(), KeyStoreError> {
        let value = std::str::from_utf8(key)
            .map_err(|e| KeyStoreError::Api(format!("account key is not UTF-8: {e}")))?;
        self.client
            .put_parameter()
            .name(&self.name)
            .value(value)
            .r#type(ParameterType::SecureString)
            .overwrite(true)
            .send()
            .await
            .map_err(|e| {
                KeyStoreError::Api(format!("PutParameter {}: {}", self.name, DisplayErrorContext(e)))
            })?;
        Ok(())
    }

    fn location(&self) -> String {
        format!("ssm:{}", self.name)
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("failed to load account key from {location}: {source}")]
    Load {
        location: String,
        #[source]
        source: KeyStoreError,
    },

    #[error("failed to decode account key from {location}: {reason}")]
    Decode { location: String, reason: String },

    #[error("failed to store account key in {location}: {source}")]
    Save {
        location: String,
        #[source]
        source: KeyStoreError,
    },

    #[error("failed to encode account credentials: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("ACME account error: {0}")]
    Acme(#[from] instant_acme::Error),
}

/// Decoded contents of the key store
pub enum StoredAccount {
    Existing(AccountCredentials),
    /// Nothing stored yet; an account is created at first issuance.
    Missing,
}

impl fmt::Debug for StoredAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredAccount::Existing(_) => f.write_str("Existing(..)"),
            StoredAccount::Missing => f.write_str("Missing"),
        }
    }
}

/// A bare private key lacks the account URL, so it cannot be reused.
const PEM_KEY_REASON: &str = "found a PEM private key, expected ACME account credentials JSON \
     (key and account URL); point the store at an empty location to register a new account";

/// Load and decode the stored account.
///
/// A missing key is not an error; undecodable contents are.
pub async fn load_account_key(store: &dyn AccountKeyStore) -> Result<StoredAccount, AccountError> {
    let bytes = match store.load().await {
        Ok(bytes) => bytes,
        Err(KeyStoreError::NotFound) => {
            info!(location = %store.location(), "No ACME account stored yet");
            return Ok(StoredAccount::Missing);
        }
        Err(source) => {
            return Err(AccountError::Load {
                location: store.location(),
                source,
            });
        }
    };

    let credentials =
        serde_json::from_slice::<AccountCredentials>(&bytes).map_err(|e| AccountError::Decode {
            location: store.location(),
            reason: if ::pem::parse(&bytes).is_ok() {
                PEM_KEY_REASON.to_string()
            } else {
                e.to_string()
            },
        })?;
    Ok(StoredAccount::Existing(credentials))
}

/// Turn a stored account into a live one, registering and persisting a new
/// account when none is stored.
pub async fn open_account(
    stored: StoredAccount,
    store: &dyn AccountKeyStore,
    directory_url: &str,
    contact_email: Option<&str>,
) -> Result<Account, AccountError> {
    match stored {
        StoredAccount::Existing(credentials) => Ok(Account::builder()?
            .from_credentials(credentials)
            .await?),
        StoredAccount::Missing => {
            let contact = contact_email.map(|e| format!("mailto:{e}"));
            let contact_refs: Vec<&str> = contact.as_deref().into_iter().collect();
            let new_account = NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            };

            let (account, credentials) = Account::builder()?
                .create(&new_account, directory_url.to_string(), None)
                .await?;

            let encoded = serde_json::to_vec_pretty(&credentials).map_err(AccountError::Encode)?;
            store
                .save(&encoded)
                .await
                .map_err(|source| AccountError::Save {
                    location: store.location(),
                    source,
                })?;
            info!(location = %store.location(), "Registered new ACME account");
            Ok(account)
        }
    }
}
