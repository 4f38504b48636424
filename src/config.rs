use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpfConfig {
    /// Value of the `%{r}` macro
    #[serde(default = "default_receiving_domain")]
    pub receiving_domain: String,
    /// Explanation template for failures the domain does not explain
    #[serde(default)]
    pub default_explanation: Option<String>,
    #[serde(default)]
    pub dns: DnsConfig,
    /// Domains whose policy is read from another domain's record
    #[serde(default)]
    pub rewrites: HashMap<String, String>,
    /// Locally published policies, keyed by domain
    #[serde(default)]
    pub records: HashMap<String, RecordConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Resolve `%{p}` through reverse DNS
    #[serde(default)]
    pub identity_lookup: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    pub terms: Vec<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}

fn default_receiving_domain() -> String {
    "unknown".to_string()
}

fn default_timeout_seconds() -> u64 {
    5
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            identity_lookup: false,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for SpfConfig {
    fn default() -> Self {
        let mut records = HashMap::new();
        records.insert(
            "example.com".to_string(),
            RecordConfig {
                terms: vec![
                    "ip4:192.0.2.0/24".to_string(),
                    "ip6:2001:db8::/32".to_string(),
                    "-all".to_string(),
                ],
                explanation: Some("%{i} is not one of %{d}'s designated mail servers".to_string()),
            },
        );

        Self {
            receiving_domain: "mx.example.net".to_string(),
            default_explanation: Some("Mail from %{d} rejected".to_string()),
            dns: DnsConfig::default(),
            rewrites: HashMap::new(),
            records,
        }
    }
}

impl SpfConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: SpfConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        log::info!(
            "Loaded {} record(s) and {} rewrite(s) from {}",
            config.records.len(),
            config.rewrites.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: SpfConfig = serde_yaml::from_str("records: {}").unwrap();
        assert_eq!(config.receiving_domain, "unknown");
        assert!(config.default_explanation.is_none());
        assert!(!config.dns.identity_lookup);
        assert_eq!(config.dns.timeout_seconds, 5);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
receiving_domain: mx.example.net
default_explanation: "Mail from %{d} rejected"
dns:
  identity_lookup: true
  timeout_seconds: 2
rewrites:
  partner.example: partner.local
records:
  partner.local:
    terms: ["ip4:198.51.100.0/24", "~all"]
"#;
        let config: SpfConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.dns.timeout_seconds, 2);
        assert_eq!(config.rewrites["partner.example"], "partner.local");
        assert_eq!(config.records["partner.local"].terms.len(), 2);
        assert!(config.records["partner.local"].explanation.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spf-policy.yaml");

        SpfConfig::default().save_to_file(&path).unwrap();
        let loaded = SpfConfig::load_from_file(&path).unwrap();

        assert_eq!(loaded.receiving_domain, "mx.example.net");
        assert_eq!(loaded.records["example.com"].terms.len(), 3);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = SpfConfig::load_from_file("/nonexistent/spf-policy.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/spf-policy.yaml"));
    }
}
