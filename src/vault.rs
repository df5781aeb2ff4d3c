use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{FieldError, VaultError};
use crate::model::{VaultItem, VaultRecord, VaultStatus};

pub const DEFAULT_CLIENT_ID_FIELD: &str = "login.username";
pub const DEFAULT_CLIENT_SECRET_FIELD: &str = "login.password";

/// Gateway to the Bitwarden CLI. Every call is a separate `bw` invocation, so
/// each one carries the session token explicitly.
#[derive(Debug, Clone)]
pub struct Bitwarden {
    program: OsString,
    base_args: Vec<OsString>,
}

impl Default for Bitwarden {
    fn default() -> Self {
        Self::with_command("bw", Vec::<OsString>::new())
    }
}

impl Bitwarden {
    /// Runs `program base_args... <operation args>` instead of plain `bw`.
    pub fn with_command<P, A>(program: P, base_args: impl IntoIterator<Item = A>) -> Self
    where
        P: Into<OsString>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            base_args: base_args.into_iter().map(Into::into).collect(),
        }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// True if the CLI resolves on PATH (or is an existing file when given as a path).
    pub fn is_installed(&self) -> bool {
        let program = Path::new(&self.program);
        if program.as_os_str().is_empty() {
            return false;
        }
        if program.components().count() > 1 || program.is_absolute() {
            return is_executable_file(program);
        }
        let Some(path) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&path).any(|dir| {
            if is_executable_file(&dir.join(program)) {
                return true;
            }
            #[cfg(windows)]
            {
                let mut exe = program.as_os_str().to_owned();
                exe.push(".exe");
                if is_executable_file(&dir.join(exe)) {
                    return true;
                }
            }
            false
        })
    }

    /// Vault status, optionally scoped to a session. Never fails: any problem
    /// running `bw status` or reading its reply counts as unauthenticated.
    pub async fn status(&self, session: &str) -> VaultStatus {
        let mut args = vec!["status"];
        if !session.is_empty() {
            args.extend(["--session", session]);
        }
        let output = match self.command(args).output().await {
            Ok(out) => out,
            Err(e) => {
                debug!("bw status could not be run: {}", e);
                return VaultStatus::Unauthenticated;
            }
        };
        if !output.status.success() {
            debug!("bw status exited with {}", output.status);
            return VaultStatus::Unauthenticated;
        }
        parse_status(&output.stdout).unwrap_or_else(|e| {
            debug!("bw status reply unreadable: {}", e);
            VaultStatus::Unauthenticated
        })
    }

    /// Unlocks the vault and returns the raw session token. The passphrase is
    /// written to the child's stdin, never passed as an argument or variable.
    pub async fn unlock(&self, passphrase: &str) -> Result<String, VaultError> {
        let mut cmd = self.command(["unlock", "--passwordfile", "/dev/stdin", "--raw"]);
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn().map_err(VaultError::Spawn)?;
        if let Some(mut stdin) = child.stdin.take() {
            // a child that exits early closes its end; the exit status reports why
            if let Err(e) = stdin.write_all(passphrase.as_bytes()).await {
                debug!("writing passphrase to bw failed: {}", e);
            }
        }
        let output = child.wait_with_output().await.map_err(VaultError::Spawn)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("bw exited with {}", output.status)
            } else {
                stderr
            };
            return Err(VaultError::Unlock { message });
        }
        let session = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if session.is_empty() {
            return Err(VaultError::EmptySession);
        }
        Ok(session)
    }

    /// Lists vault items, optionally filtered by a search term.
    pub async fn list_items(
        &self,
        session: &str,
        search: Option<&str>,
    ) -> Result<Vec<VaultItem>, VaultError> {
        let mut args = vec!["list", "items", "--session", session];
        if let Some(term) = search.filter(|s| !s.is_empty()) {
            args.extend(["--search", term]);
        }
        let stdout = self.run("list items", args).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    /// Fetches the full record of one item, including custom fields and notes.
    pub async fn fetch_item(&self, session: &str, item_id: &str) -> Result<VaultRecord, VaultError> {
        let stdout = self
            .run("get item", ["get", "item", item_id, "--session", session])
            .await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn run<I, S>(&self, operation: &'static str, args: I) -> Result<Vec<u8>, VaultError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        debug!("running bw {}", operation);
        let output = self
            .command(args)
            .output()
            .await
            .map_err(VaultError::Spawn)?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(VaultError::Query {
                operation,
                output: combined.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    metadata.is_file() && has_exec_bit(&metadata)
}

#[cfg(unix)]
fn has_exec_bit(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn has_exec_bit(_metadata: &fs::Metadata) -> bool {
    true
}

#[derive(Deserialize)]
struct StatusReply {
    #[serde(default)]
    status: String,
}

/// Reads the `status` field of a `bw status` reply.
pub fn parse_status(data: &[u8]) -> Result<VaultStatus, serde_json::Error> {
    let reply: StatusReply = serde_json::from_slice(data)?;
    Ok(VaultStatus::from_reported(&reply.status))
}

/// Resolves a field path against a vault record.
///
/// Supported: `login.username`, `login.password`, `fields.<name>` (first
/// match), `notes`. The empty path resolves to an empty string.
pub fn resolve_field(record: &VaultRecord, path: &str) -> Result<String, FieldError> {
    match path {
        "" => Ok(String::new()),
        "login.username" => record
            .login
            .as_ref()
            .map(|l| l.username.clone())
            .ok_or(FieldError::NoLogin),
        "login.password" => record
            .login
            .as_ref()
            .map(|l| l.password.clone())
            .ok_or(FieldError::NoLogin),
        "notes" => Ok(record.notes.clone()),
        _ => match path.strip_prefix("fields.") {
            Some(name) => record
                .fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.value.clone())
                .ok_or_else(|| FieldError::NotFound {
                    name: name.to_string(),
                }),
            None => Err(FieldError::UnsupportedPath {
                path: path.to_string(),
            }),
        },
    }
}
