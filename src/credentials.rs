use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Credentials file structure
///
/// Format:
/// ```toml
/// [provider.profile_name]
/// client_id = "your_provider_client_id"
/// client_secret = "your_provider_client_secret"
///
/// [sftp.profile_name]
/// password = "your_sftp_password_here"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Credentials {
    #[serde(default)]
    pub provider: HashMap<String, ProviderProfile>,
    #[serde(default)]
    pub sftp: HashMap<String, SftpProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderProfile {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SftpProfile {
    pub password: String,
}

/// Get the default credentials file path: ~/.config/meeting_pool/credentials.toml
pub fn get_credentials_path() -> PathBuf {
    let home = std::env::var("HOME").expect("HOME environment variable not set");
    PathBuf::from(home)
        .join(".config")
        .join("meeting_pool")
        .join("credentials.toml")
}

/// Load credentials from the default location
/// Returns None if the file doesn't exist
pub fn load_credentials() -> Result<Option<Credentials>, Box<dyn std::error::Error + Send + Sync>> {
    let creds_path = get_credentials_path();

    if !creds_path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&creds_path)?;
    let credentials: Credentials = toml::from_str(&content)?;

    Ok(Some(credentials))
}

/// Get the provider client id/secret for a profile
pub fn get_provider_profile(
    credentials: &Option<Credentials>,
    profile: &str,
) -> Result<ProviderProfile, String> {
    match credentials {
        Some(creds) => creds.provider.get(profile).cloned().ok_or_else(|| {
            format!(
                "Credential profile '[provider.{}]' not found in credentials file",
                profile
            )
        }),
        None => Err(format!(
            "Credentials file not found. Expected at: {}",
            get_credentials_path().display()
        )),
    }
}

/// Get the SFTP password for a profile
pub fn get_sftp_password(
    credentials: &Option<Credentials>,
    profile: &str,
) -> Result<String, String> {
    match credentials {
        Some(creds) => creds
            .sftp
            .get(profile)
            .map(|p| p.password.clone())
            .ok_or_else(|| {
                format!(
                    "Credential profile '[sftp.{}]' not found in credentials file",
                    profile
                )
            }),
        None => Err(format!(
            "Credentials file not found. Expected at: {}",
            get_credentials_path().display()
        )),
    }
}
