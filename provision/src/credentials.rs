//! Credential store
//!
//! Secret material is declared once under a logical name and handed out by
//! reference only. Plaintext leaves the store through `resolve`, and only to
//! principals that were granted read access.

use crate::context::DeploymentContext;
use crate::error::{Error, Result};
use crate::graph::RemovalPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

/// Password that never prints itself
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Plaintext, for handing to the database client only
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Password {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password(********)")
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

/// Secret payload as stored by the backend
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecretMaterial {
    pub dbname: String,
    pub username: String,
    pub password: Password,
}

/// Indirect handle to secret material
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialRef {
    /// Logical name, unique per deployment
    pub name: String,
    /// Stable backend reference
    pub id: String,
}

impl CredentialRef {
    /// Rebuild a reference from the backend id a consumer was handed
    pub fn from_id(id: &str) -> Result<Self> {
        let name = id
            .rsplit_once(":secret:")
            .map(|(_, name)| name)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::credential_resolution(format!("{} is not a secret reference", id))
            })?;
        Ok(Self {
            name: name.to_string(),
            id: id.to_string(),
        })
    }
}

/// Resolved credential, only ever held by an authorized consumer
#[derive(Debug, Clone)]
pub struct Credential {
    pub reference: CredentialRef,
    pub database_name: String,
    pub username: String,
    pub password: Password,
}

/// Serializable declaration of a credential; carries no secret value
#[derive(Debug, Clone, Serialize)]
pub struct CredentialDefinition {
    pub name: String,
    pub id: String,
    pub description: String,
    pub removal_policy: RemovalPolicy,
    pub readers: BTreeSet<String>,
}

/// External secret storage
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Store `material` under `reference`; reusing an existing entry is allowed
    async fn put(&self, reference: &CredentialRef, material: &SecretMaterial) -> Result<()>;

    /// Fetch the current material for `reference`
    async fn get(&self, reference: &CredentialRef) -> Result<SecretMaterial>;
}

/// Secret backend kept in process memory
#[derive(Default)]
pub struct InMemorySecretBackend {
    entries: Mutex<HashMap<String, SecretMaterial>>,
}

impl InMemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretBackend for InMemorySecretBackend {
    async fn put(&self, reference: &CredentialRef, material: &SecretMaterial) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&reference.id) {
            debug!(secret = %reference.name, "Secret exists, reusing");
        } else {
            entries.insert(reference.id.clone(), material.clone());
        }
        Ok(())
    }

    async fn get(&self, reference: &CredentialRef) -> Result<SecretMaterial> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&reference.id)
            .cloned()
            .ok_or_else(|| {
                Error::credential_resolution(format!("secret {} not found", reference.name))
            })
    }
}

/// Secret backend reading `<dir>/<name>.json` files
///
/// Each file holds `{"dbname": ..., "username": ..., "password": ...}`.
pub struct FileSecretBackend {
    dir: PathBuf,
}

impl FileSecretBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, reference: &CredentialRef) -> PathBuf {
        self.dir.join(format!("{}.json", reference.name))
    }
}

#[async_trait]
impl SecretBackend for FileSecretBackend {
    async fn put(&self, reference: &CredentialRef, material: &SecretMaterial) -> Result<()> {
        let path = self.path(reference);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(secret = %reference.name, "Secret file exists, reusing");
            return Ok(());
        }
        let body = json!({
            "dbname": material.dbname,
            "username": material.username,
            "password": material.password.expose(),
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&body)?)
            .await
            .map_err(|e| {
                Error::provisioning(
                    reference.id.clone(),
                    format!("write {}: {}", path.display(), e),
                )
            })
    }

    async fn get(&self, reference: &CredentialRef) -> Result<SecretMaterial> {
        let path = self.path(reference);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::credential_resolution(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::credential_resolution(format!("parse {}: {}", path.display(), e)))
    }
}

struct Entry {
    reference: CredentialRef,
    description: String,
    removal_policy: RemovalPolicy,
    pending: Option<SecretMaterial>,
    readers: BTreeSet<String>,
}

/// Registry of declared credentials backed by a [`SecretBackend`]
pub struct CredentialStore {
    ctx: DeploymentContext,
    backend: Arc<dyn SecretBackend>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl CredentialStore {
    pub fn new(ctx: &DeploymentContext, backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            ctx: ctx.clone(),
            backend,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register secret material under `name` and return its reference.
    ///
    /// Nothing reaches the backend until [`CredentialStore::provision`] runs
    /// during apply. A name may be declared once per deployment.
    pub fn declare(
        &self,
        name: &str,
        database_name: &str,
        username: &str,
        password: Password,
        removal_policy: RemovalPolicy,
    ) -> Result<CredentialRef> {
        if name.trim().is_empty() {
            return Err(Error::validation("credential name must not be empty"));
        }
        if database_name.trim().is_empty() || username.trim().is_empty() {
            return Err(Error::validation(format!(
                "credential {} needs a database name and a username",
                name
            )));
        }
        if password.is_empty() {
            return Err(Error::validation(format!("credential {} has an empty password", name)));
        }

        let mut entries = self.lock();
        if entries.contains_key(name) {
            return Err(Error::validation(format!("credential {} declared twice", name)));
        }

        let reference = CredentialRef {
            name: name.to_string(),
            id: self.ctx.secret_arn(name),
        };
        entries.insert(
            name.to_string(),
            Entry {
                reference: reference.clone(),
                description: "Database master user credentials".to_string(),
                removal_policy,
                pending: Some(SecretMaterial {
                    dbname: database_name.to_string(),
                    username: username.to_string(),
                    password,
                }),
                readers: BTreeSet::new(),
            },
        );

        info!(secret = %name, user = %username, database = %database_name, "Credential declared");
        Ok(reference)
    }

    /// Authorize `principal` to resolve `reference`
    pub fn grant_read(&self, reference: &CredentialRef, principal: &str) -> Result<()> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(&reference.name)
            .ok_or_else(|| Error::validation(format!("unknown credential {}", reference.name)))?;
        entry.readers.insert(principal.to_string());
        debug!(secret = %reference.name, principal, "Read access granted");
        Ok(())
    }

    /// Write the declared material to the backend
    #[instrument(skip_all, fields(secret = %reference.name))]
    pub async fn provision(&self, reference: &CredentialRef) -> Result<()> {
        let material = {
            let entries = self.lock();
            let entry = entries
                .get(&reference.name)
                .ok_or_else(|| {
                    Error::provisioning(reference.id.clone(), "credential was never declared")
                })?;
            entry.pending.clone()
        };

        match material {
            Some(material) => {
                self.backend.put(reference, &material).await.map_err(|e| match e {
                    Error::Provisioning { .. } => e,
                    other => Error::provisioning(reference.id.clone(), other.to_string()),
                })?;
                info!("Credential stored");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Fetch the credential live on behalf of `principal`
    #[instrument(skip_all, fields(secret = %reference.name, principal = %principal))]
    pub async fn resolve(&self, reference: &CredentialRef, principal: &str) -> Result<Credential> {
        {
            let entries = self.lock();
            let entry = entries.get(&reference.name).ok_or_else(|| {
                Error::credential_resolution(format!("unknown credential {}", reference.name))
            })?;
            if !entry.readers.contains(principal) {
                warn!("Resolution refused for unauthorized principal");
                return Err(Error::credential_resolution(format!(
                    "{} is not authorized to read {}",
                    principal, reference.name
                )));
            }
        }

        let material = self.backend.get(reference).await.map_err(|e| match e {
            Error::CredentialResolution(_) => e,
            other => Error::credential_resolution(other.to_string()),
        })?;

        debug!("Credential resolved");
        Ok(Credential {
            reference: reference.clone(),
            database_name: material.dbname,
            username: material.username,
            password: material.password,
        })
    }

    pub fn definition(&self, reference: &CredentialRef) -> Option<CredentialDefinition> {
        self.lock().get(&reference.name).map(|entry| CredentialDefinition {
            name: entry.reference.name.clone(),
            id: entry.reference.id.clone(),
            description: entry.description.clone(),
            removal_policy: entry.removal_policy,
            readers: entry.readers.clone(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    fn store() -> CredentialStore {
        CredentialStore::new(&test_context(), Arc::new(InMemorySecretBackend::new()))
    }

    fn declare(store: &CredentialStore) -> CredentialRef {
        store
            .declare(
                "db-master",
                "app",
                "admin",
                Password::new("hunter2-secret"),
                RemovalPolicy::Destroy,
            )
            .unwrap()
    }

    #[test]
    fn test_password_is_redacted() {
        let password = Password::new("hunter2-secret");
        assert!(!format!("{:?}", password).contains("hunter2"));
        assert!(!password.to_string().contains("hunter2"));
        assert_eq!(password.expose(), "hunter2-secret");
    }

    #[test]
    fn test_declare_validates_and_rejects_duplicates() {
        let store = store();
        let reference = declare(&store);
        assert_eq!(
            reference.id,
            "arn:aws:secretsmanager:eu-west-1:123456789012:secret:db-master"
        );

        let dup =
            store.declare("db-master", "app", "admin", Password::new("x"), RemovalPolicy::Destroy);
        assert!(matches!(dup, Err(Error::Validation(_))));

        let empty = store.declare("other", "", "admin", Password::new("x"), RemovalPolicy::Destroy);
        assert!(matches!(empty, Err(Error::Validation(_))));

        let no_pass =
            store.declare("other", "app", "admin", Password::new(""), RemovalPolicy::Destroy);
        assert!(matches!(no_pass, Err(Error::Validation(_))));
    }

    #[test]
    fn test_reference_from_id() {
        let reference =
            CredentialRef::from_id("arn:aws:secretsmanager:eu-west-1:123456789012:secret:db-master")
                .unwrap();
        assert_eq!(reference.name, "db-master");

        assert!(matches!(
            CredentialRef::from_id("db-master"),
            Err(Error::CredentialResolution(_))
        ));
        assert!(CredentialRef::from_id("arn:aws:secretsmanager:x:y:secret:").is_err());
    }

    #[test]
    fn test_definition_carries_no_password() {
        let store = store();
        let reference = declare(&store);
        store.grant_read(&reference, "job:initialize-db").unwrap();

        let definition = store.definition(&reference).unwrap();
        let text = serde_json::to_string(&definition).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("job:initialize-db"));
    }

    #[tokio::test]
    async fn test_resolve_requires_grant() {
        let store = store();
        let reference = declare(&store);
        store.provision(&reference).await.unwrap();

        let err = store.resolve(&reference, "app-server").await.unwrap_err();
        assert!(matches!(err, Error::CredentialResolution(_)));

        store.grant_read(&reference, "job:initialize-db").unwrap();
        let credential = store.resolve(&reference, "job:initialize-db").await.unwrap();
        assert_eq!(credential.username, "admin");
        assert_eq!(credential.database_name, "app");
        assert_eq!(credential.password.expose(), "hunter2-secret");
    }

    #[tokio::test]
    async fn test_resolve_before_provision_fails() {
        let store = store();
        let reference = declare(&store);
        store.grant_read(&reference, "job:initialize-db").unwrap();

        let err = store.resolve(&reference, "job:initialize-db").await.unwrap_err();
        assert!(matches!(err, Error::CredentialResolution(_)));
    }

    #[tokio::test]
    async fn test_backend_reuses_existing_entry() {
        let backend = InMemorySecretBackend::new();
        let reference = CredentialRef {
            name: "db-master".to_string(),
            id: "arn:secret:db-master".to_string(),
        };
        let first = SecretMaterial {
            dbname: "app".to_string(),
            username: "admin".to_string(),
            password: Password::new("first"),
        };
        let second = SecretMaterial {
            password: Password::new("second"),
            ..first.clone()
        };
        backend.put(&reference, &first).await.unwrap();
        backend.put(&reference, &second).await.unwrap();
        assert_eq!(backend.get(&reference).await.unwrap().password.expose(), "first");
    }
}
