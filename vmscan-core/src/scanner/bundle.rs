//! Scanner CLI configuration handed to every launched scanner instance.

use serde::Serialize;
use vmscan_model::ScanFamiliesConfig;

use crate::config::ScannerToolsConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyConfig<T> {
    pub enabled: bool,
    pub scanners: Vec<&'static str>,
    #[serde(flatten)]
    pub settings: T,
}

impl<T> FamilyConfig<T> {
    fn new(enabled: bool, scanners: &[&'static str], settings: T) -> Self {
        Self {
            enabled,
            scanners: scanners.to_vec(),
            settings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoSettings {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilitySettings {
    pub trivy_server_address: Option<String>,
    pub trivy_server_timeout_seconds: u64,
    pub grype_server_address: Option<String>,
    pub grype_server_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsSettings {
    pub gitleaks_binary_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MalwareSettings {
    pub clam_binary_path: String,
    pub freshclam_binary_path: String,
    pub alternative_freshclam_mirror_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootkitsSettings {
    pub chkrootkit_binary_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MisconfigurationSettings {
    pub lynis_install_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExploitsSettings {
    pub exploit_db_address: String,
}

/// Per-family scanner configuration. Built once per scan and serialised into
/// every [`ScanJobConfig`](crate::provider::ScanJobConfig).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerCliConfig {
    pub sbom: FamilyConfig<NoSettings>,
    pub vulnerabilities: FamilyConfig<VulnerabilitySettings>,
    pub secrets: FamilyConfig<SecretsSettings>,
    pub malware: FamilyConfig<MalwareSettings>,
    pub rootkits: FamilyConfig<RootkitsSettings>,
    pub misconfiguration: FamilyConfig<MisconfigurationSettings>,
    pub exploits: FamilyConfig<ExploitsSettings>,
}

impl ScannerCliConfig {
    pub fn new(families: &ScanFamiliesConfig, tools: &ScannerToolsConfig) -> Self {
        Self {
            sbom: FamilyConfig::new(families.sbom, &["syft", "trivy"], NoSettings {}),
            vulnerabilities: FamilyConfig::new(
                families.vulnerabilities,
                &["grype", "trivy"],
                VulnerabilitySettings {
                    trivy_server_address: tools.trivy_server_address.clone(),
                    trivy_server_timeout_seconds: tools.trivy_server_timeout_ms / 1_000,
                    grype_server_address: tools.grype_server_address.clone(),
                    grype_server_timeout_seconds: tools.grype_server_timeout_ms / 1_000,
                },
            ),
            secrets: FamilyConfig::new(
                families.secrets,
                &["gitleaks"],
                SecretsSettings {
                    gitleaks_binary_path: tools.gitleaks_binary_path.clone(),
                },
            ),
            malware: FamilyConfig::new(
                families.malware,
                &["clam"],
                MalwareSettings {
                    clam_binary_path: tools.clam_binary_path.clone(),
                    freshclam_binary_path: tools.freshclam_binary_path.clone(),
                    alternative_freshclam_mirror_url: tools
                        .alternative_freshclam_mirror_url
                        .clone(),
                },
            ),
            rootkits: FamilyConfig::new(
                families.rootkits,
                &["chkrootkit"],
                RootkitsSettings {
                    chkrootkit_binary_path: tools.chkrootkit_binary_path.clone(),
                },
            ),
            misconfiguration: FamilyConfig::new(
                families.misconfigurations,
                &["lynis"],
                MisconfigurationSettings {
                    lynis_install_path: tools.lynis_install_path.clone(),
                },
            ),
            exploits: FamilyConfig::new(
                families.exploits,
                &["exploitdb"],
                ExploitsSettings {
                    exploit_db_address: tools.exploit_db_address.clone(),
                },
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
