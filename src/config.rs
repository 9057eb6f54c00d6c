use serde::{Deserialize, Serialize};

/// Service configuration, read once at startup and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the MBS REST API the modulemd documents come from.
    pub mbs_api_url: String,
    /// Koji hub XML-RPC endpoint builds are tagged through.
    pub koji_hub_url: String,
    #[serde(default)]
    pub koji_user: Option<String>,
    #[serde(default)]
    pub koji_password: Option<String>,
    /// Path of the YAML file holding the ordered tagging rules.
    pub rules_file: String,
    /// When set, matched tags are logged instead of applied.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mbs_api_url: "https://mbs.fedoraproject.org/module-build-service/1/".to_string(),
            koji_hub_url: "https://koji.fedoraproject.org/kojihub".to_string(),
            koji_user: None,
            koji_password: None,
            rules_file: "/etc/module-tagger/rules.yaml".to_string(),
            dry_run: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
