//! Secret fetching utilities for Kubernetes secrets

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::error::{Error, Result};

/// Fetch a secret from Kubernetes
pub async fn get_secret(client: &Client, name: &str, namespace: &str) -> Result<Secret> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets.get(name).await.map_err(|e| match e {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            Error::SecretNotFound(format!("{}/{}", namespace, name))
        }
        other => Error::Kube(other),
    })
}

/// Key names carried by a secret, from both `data` and `stringData`
pub fn secret_keys(secret: &Secret) -> Vec<String> {
    let mut keys: Vec<String> = secret
        .data
        .iter()
        .flat_map(|data| data.keys().cloned())
        .chain(
            secret
                .string_data
                .iter()
                .flat_map(|data| data.keys().cloned()),
        )
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    #[test]
    fn keys_merge_data_and_string_data() {
        let secret = Secret {
            data: Some(BTreeMap::from([
                ("secret-key".to_string(), ByteString(b"s".to_vec())),
                ("access-id".to_string(), ByteString(b"a".to_vec())),
            ])),
            string_data: Some(BTreeMap::from([(
                "access-id".to_string(),
                "a".to_string(),
            )])),
            ..Default::default()
        };
        assert_eq!(secret_keys(&secret), vec!["access-id", "secret-key"]);
        assert!(secret_keys(&Secret::default()).is_empty());
    }
}
