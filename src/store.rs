use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::model::OAuthClient;

pub const CONFIG_DIR_ENV: &str = "TKZ_CONFIG_DIR";
const CLIENTS_FILE: &str = "clients.json";

/// `$TKZ_CONFIG_DIR`, else `~/.config/tkz`.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|h| !h.is_empty())
        .ok_or(ConfigError::NoHomeDir)?;
    Ok(PathBuf::from(home).join(".config").join("tkz"))
}

/// Creates the config directory (owner-only on unix) if it is missing.
pub fn ensure_config_dir(dir: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(io_err)?;
    }
    Ok(())
}

#[derive(Deserialize)]
struct ClientsFile {
    #[serde(default)]
    clients: Option<Vec<OAuthClient>>,
}

#[derive(Serialize)]
struct ClientsFileRef<'a> {
    clients: &'a [OAuthClient],
}

/// Named OAuth client configurations persisted as JSON.
#[derive(Debug, Clone)]
pub struct ClientStore {
    path: PathBuf,
}

impl ClientStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(CLIENTS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty list.
    pub fn load(&self) -> Result<Vec<OAuthClient>, ConfigError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no clients file at {}", self.path.display());
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let file: ClientsFile =
            serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        let clients = file.clients.unwrap_or_default();
        debug!("loaded {} client(s) from {}", clients.len(), self.path.display());
        Ok(clients)
    }

    /// Copies the current file to `clients.json.bak-<unix time>` beside it, so
    /// a file that failed to load survives the next save.
    pub fn backup(&self) -> Result<PathBuf, ConfigError> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".bak-{}", stamp));
        let backup = PathBuf::from(name);
        fs::copy(&self.path, &backup).map_err(|source| ConfigError::Io {
            path: backup.clone(),
            source,
        })?;
        info!("kept a copy of {} at {}", self.path.display(), backup.display());
        Ok(backup)
    }

    /// Replaces the file in one step; readers see either the old or the new contents.
    pub fn save(&self, clients: &[OAuthClient]) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };
        let mut data = serde_json::to_vec_pretty(&ClientsFileRef { clients })
            .map_err(|e| io_err(io::Error::other(e)))?;
        data.push(b'\n');
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        atomic_write_file(&self.path, &data).map_err(io_err)?;
        debug!("saved {} client(s) to {}", clients.len(), self.path.display());
        Ok(())
    }
}

fn atomic_write_file(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or(CLIENTS_FILE),
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    let tmp_path = parent.join(tmp_name);

    let written = (|| {
        let mut options = fs::OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    written
}
