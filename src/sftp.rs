//! SFTP-backed durable storage
//!
//! Uploads are atomic: data lands under a `.tmpupload` name, the size is
//! verified against the server, and only then is the file renamed into
//! place. A half-written upload is therefore never visible at the final
//! path, and `exists` checks only ever see complete objects.

use ssh2::{Session, Sftp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::storage::{StorageClient, StorageError, StorageRef};

const UPLOAD_BUFFER_SIZE: usize = 64 * 1024;
const REMOTE_FILE_PERMISSIONS: i32 = 0o644;
const REMOTE_DIR_PERMISSIONS: i32 = 0o755;

/// Connection settings for the SFTP storage backend
#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Base directory all uploads live under
    pub remote_dir: PathBuf,
}

impl SftpSettings {
    /// Build settings from the config file structure, resolving the password
    /// from the credentials file via the configured profile
    pub fn from_storage_config(
        config: &StorageConfig,
        credentials: &Option<crate::credentials::Credentials>,
    ) -> Result<Self, String> {
        let password =
            crate::credentials::get_sftp_password(credentials, &config.credential_profile)?;
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password,
            remote_dir: PathBuf::from(&config.remote_dir),
        })
    }
}

/// SFTP storage client. Connects per operation; sessions are not reused
/// across the long idle gaps between pipeline steps.
pub struct SftpStorage {
    settings: SftpSettings,
}

struct SftpConn {
    _session: Session,
    sftp: Sftp,
}

impl SftpStorage {
    pub fn new(settings: SftpSettings) -> Self {
        Self { settings }
    }

    fn connect(&self) -> Result<SftpConn, StorageError> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let tcp = TcpStream::connect(&addr).map_err(|e| {
            StorageError::Transient(format!("Failed to connect to {}: {}", addr, e))
        })?;

        let mut session = Session::new()
            .map_err(|e| StorageError::Transient(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| StorageError::Transient(format!("SSH handshake failed: {}", e)))?;

        session
            .userauth_password(&self.settings.username, &self.settings.password)
            .map_err(|e| {
                StorageError::Permanent(format!(
                    "Password authentication failed for user '{}': {}",
                    self.settings.username, e
                ))
            })?;

        if !session.authenticated() {
            return Err(StorageError::Permanent(
                "Authentication failed (session not authenticated)".to_string(),
            ));
        }

        let sftp = session
            .sftp()
            .map_err(|e| StorageError::Transient(format!("Failed to open SFTP channel: {}", e)))?;

        Ok(SftpConn {
            _session: session,
            sftp,
        })
    }

    /// Create a directory recursively, similar to `mkdir -p`
    fn mkdir_p(conn: &SftpConn, path: &Path) -> Result<(), StorageError> {
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            if conn.sftp.mkdir(&current, REMOTE_DIR_PERMISSIONS).is_err() {
                // Either it already exists or creation genuinely failed
                match conn.sftp.stat(&current) {
                    Ok(stat) => {
                        if !stat.is_dir() {
                            return Err(StorageError::Permanent(format!(
                                "Remote path '{}' exists but is not a directory",
                                current.display()
                            )));
                        }
                    }
                    Err(e) => {
                        return Err(StorageError::Transient(format!(
                            "Failed to create remote directory '{}': {}",
                            current.display(),
                            e
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl StorageClient for SftpStorage {
    fn upload(
        &self,
        reader: &mut dyn Read,
        name: &str,
        folder: &str,
        size: u64,
    ) -> Result<StorageRef, StorageError> {
        let conn = self.connect()?;

        let target_dir = self.settings.remote_dir.join(folder);
        Self::mkdir_p(&conn, &target_dir)?;

        let final_path = target_dir.join(name);
        // Stable temp name so a crashed upload is overwritten on retry
        let temp_path = PathBuf::from(format!("{}.tmpupload", final_path.display()));

        let mut remote_file = conn
            .sftp
            .open_mode(
                &temp_path,
                ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE,
                REMOTE_FILE_PERMISSIONS,
                ssh2::OpenType::File,
            )
            .map_err(|e| {
                StorageError::Transient(format!(
                    "Failed to create remote file '{}': {}",
                    temp_path.display(),
                    e
                ))
            })?;

        let mut buffer = vec![0u8; UPLOAD_BUFFER_SIZE];
        loop {
            let n = reader
                .read(&mut buffer)
                .map_err(|e| StorageError::Permanent(format!("Failed to read artifact: {}", e)))?;
            if n == 0 {
                break;
            }
            remote_file.write_all(&buffer[..n]).map_err(|e| {
                StorageError::Transient(format!(
                    "Failed to write to remote file '{}': {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        remote_file.flush().map_err(|e| {
            StorageError::Transient(format!("Failed to flush remote file: {}", e))
        })?;
        drop(remote_file);

        // Verify the server saw every byte before exposing the final name
        let stat = conn.sftp.stat(&temp_path).map_err(|e| {
            StorageError::Transient(format!("Failed to stat remote file after upload: {}", e))
        })?;
        let remote_size = stat.size.unwrap_or(0);
        if remote_size != size {
            let _ = conn.sftp.unlink(&temp_path);
            return Err(StorageError::Transient(format!(
                "Size mismatch after upload: expected {} bytes, got {}",
                size, remote_size
            )));
        }

        conn.sftp
            .rename(&temp_path, &final_path, None)
            .map_err(|e| {
                StorageError::Transient(format!(
                    "Failed to rename temp file to '{}': {}",
                    final_path.display(),
                    e
                ))
            })?;

        Ok(StorageRef(final_path.display().to_string()))
    }

    fn exists(&self, storage_ref: &StorageRef) -> Result<Option<u64>, StorageError> {
        let conn = self.connect()?;
        match conn.sftp.stat(Path::new(&storage_ref.0)) {
            Ok(stat) => Ok(Some(stat.size.unwrap_or(0))),
            Err(e) => {
                // libssh2 reports a missing file as SFTP error code 2
                if e.code() == ssh2::ErrorCode::SFTP(2) {
                    Ok(None)
                } else {
                    Err(StorageError::Transient(format!(
                        "Failed to stat '{}': {}",
                        storage_ref.0, e
                    )))
                }
            }
        }
    }

    fn delete(&self, storage_ref: &StorageRef) -> Result<(), StorageError> {
        let conn = self.connect()?;
        conn.sftp.unlink(Path::new(&storage_ref.0)).map_err(|e| {
            StorageError::Transient(format!("Failed to remove '{}': {}", storage_ref.0, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_storage_config() {
        let config = StorageConfig {
            host: "backup.example.com".to_string(),
            port: 22,
            username: "archiver".to_string(),
            credential_profile: "backup".to_string(),
            remote_dir: "/recordings".to_string(),
        };
        let mut creds = crate::credentials::Credentials::default();
        creds.sftp.insert(
            "backup".to_string(),
            crate::credentials::SftpProfile {
                password: "pass".to_string(),
            },
        );

        let settings = SftpSettings::from_storage_config(&config, &Some(creds)).unwrap();
        assert_eq!(settings.host, "backup.example.com");
        assert_eq!(settings.remote_dir, PathBuf::from("/recordings"));
    }

    #[test]
    fn test_settings_missing_profile_is_an_error() {
        let config = StorageConfig {
            host: "backup.example.com".to_string(),
            port: 22,
            username: "archiver".to_string(),
            credential_profile: "nope".to_string(),
            remote_dir: "/recordings".to_string(),
        };
        let err = SftpSettings::from_storage_config(&config, &Some(Default::default())).unwrap_err();
        assert!(err.contains("nope"));
    }
}
