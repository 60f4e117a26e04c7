use serde::{Deserialize, Serialize};

/// Google Cloud project and credential configuration shared by the
/// BigQuery reader and the Sheets writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcpConfig {
    /// Project that owns the billing export dataset.
    pub project_id: String,

    /// How OAuth access tokens are obtained.
    #[serde(default)]
    pub credentials: GcpCredentials,
}

/// GCP credential configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum GcpCredentials {
    /// Use Application Default Credentials (`GOOGLE_APPLICATION_CREDENTIALS`,
    /// gcloud user credentials, or the metadata server).
    #[default]
    Default,

    /// Use a service account key file.
    ServiceAccount { key_path: String },

    /// Use a service account key from JSON string (useful with env vars).
    ServiceAccountJson { json: String },
}

impl GcpCredentials {
    /// Short label for logs. Never includes key material.
    pub fn kind(&self) -> &'static str {
        match self {
            GcpCredentials::Default => "default",
            GcpCredentials::ServiceAccount { .. } => "service_account",
            GcpCredentials::ServiceAccountJson { .. } => "service_account_json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_default() {
        let config: GcpConfig = toml::from_str(r#"project_id = "acme-billing""#).unwrap();
        assert!(matches!(config.credentials, GcpCredentials::Default));
    }

    #[test]
    fn test_credentials_service_account() {
        let config: GcpConfig = toml::from_str(
            r#"
            project_id = "acme-billing"
            credentials = { type = "service_account", key_path = "/secrets/sa.json" }
        "#,
        )
        .unwrap();
        match config.credentials {
            GcpCredentials::ServiceAccount { key_path } => assert_eq!(key_path, "/secrets/sa.json"),
            other => panic!("unexpected credentials: {:?}", other),
        }
    }
}
