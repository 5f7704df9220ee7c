//! Secret storage abstraction and a Vault KV v2 implementation.

mod error;
pub mod vault;

pub use error::{Result, SecretError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A secret value as read from the store: either a bare string or a map of
/// fields, matching how Vault KV v2 returns its `data.data` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    String(String),
    Map(HashMap<String, String>),
}

impl SecretValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            SecretValue::String(s) => Some(s),
            SecretValue::Map(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            SecretValue::String(s) => Some(s),
            SecretValue::Map(map) => map.get(key).map(String::as_str),
        }
    }
}

/// Abstraction over a secret backend. The engine reads git/registry
/// credentials and secret bindings through this trait; only `vault` backs
/// it in production, but tests substitute an in-memory fake.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<SecretValue>;

    async fn get_field(&self, path: &str, field: &str) -> Result<String> {
        let value = self.get(path).await?;
        value
            .get(field)
            .map(str::to_string)
            .ok_or_else(|| SecretError::FieldMissing {
                path: path.to_string(),
                field: field.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn set(&self, path: &str, value: SecretValue) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::RwLock;

    /// In-memory `SecretStore` used by engine and API tests.
    #[derive(Default)]
    pub struct FakeSecretStore {
        inner: RwLock<HashMap<String, SecretValue>>,
    }

    impl FakeSecretStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(self, path: &str, value: SecretValue) -> Self {
            self.inner.write().unwrap().insert(path.to_string(), value);
            self
        }
    }

    #[async_trait]
    impl SecretStore for FakeSecretStore {
        async fn get(&self, path: &str) -> Result<SecretValue> {
            self.inner
                .read()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| SecretError::NotFound(path.to_string()))
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .inner
                .read()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn set(&self, path: &str, value: SecretValue) -> Result<()> {
            self.inner.write().unwrap().insert(path.to_string(), value);
            Ok(())
        }

        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.write().unwrap().remove(path);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_value_get_handles_both_shapes() {
        let s = SecretValue::String("tok".into());
        assert_eq!(s.as_string(), Some("tok"));
        assert_eq!(s.get("anything"), Some("tok"));

        let m = SecretValue::Map(HashMap::from([("token".to_string(), "abc".to_string())]));
        assert_eq!(m.as_string(), None);
        assert_eq!(m.get("token"), Some("abc"));
        assert_eq!(m.get("missing"), None);
    }
}
