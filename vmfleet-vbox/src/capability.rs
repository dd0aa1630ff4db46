//! External collaborators the provider drives but does not implement.
//!
//! The provider needs a remote shell into each guest, a local cache of
//! remote artifacts (disk images, guest tooling ISOs), and a way to package
//! seed files into removable media. Each is a trait so tests and alternative
//! transports can be swapped in; the structs here are the defaults the
//! gateway binary ships with.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::VboxError;

/// An established command channel into one guest.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a multi-line script with the guest's shell.
    ///
    /// # Errors
    /// Returns [`VboxError::Shell`] if the script exits non-zero.
    async fn run_script(&self, script: &str) -> Result<(), VboxError>;

    /// Run a single command line.
    ///
    /// # Errors
    /// Returns [`VboxError::Shell`] if the command exits non-zero.
    async fn run_command(&self, command: &str) -> Result<(), VboxError>;

    /// Run a single command line and capture its standard output.
    ///
    /// # Errors
    /// Returns [`VboxError::Shell`] if the command exits non-zero.
    async fn run_command_output(&self, command: &str) -> Result<String, VboxError>;
}

/// Opens [`RemoteShell`] sessions.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Connect to `user@host:port`.
    ///
    /// # Errors
    /// Returns [`VboxError::Shell`] if the guest does not accept the connection.
    async fn connect(&self, host: &str, port: u16, user: &str) -> Result<Arc<dyn RemoteShell>, VboxError>;
}

/// Local cache of remote artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Local path of the artifact published at `url`.
    ///
    /// # Errors
    /// Returns [`VboxError::Artifact`] if the artifact is not available.
    async fn resolve(&self, url: &str) -> Result<PathBuf, VboxError>;

    /// Extract the archive at `archive` into the directory `into`.
    ///
    /// # Errors
    /// Returns [`VboxError::Artifact`] if extraction fails.
    async fn unpack(&self, archive: &Path, into: &Path) -> Result<(), VboxError>;
}

/// Builds removable-media images from small text files.
#[async_trait]
pub trait MediaPackager: Send + Sync {
    /// Write an image labelled `label` containing `files` (name, contents) to `target`.
    ///
    /// # Errors
    /// Returns [`VboxError::Io`] or [`VboxError::ExternalTool`] on failure.
    async fn package(&self, label: &str, files: &[(&str, &str)], target: &Path) -> Result<(), VboxError>;
}

/// Remote shell over the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshCli {
    binary: PathBuf,
}

impl Default for SshCli {
    fn default() -> Self {
        Self::new(PathBuf::from("ssh"))
    }
}

impl SshCli {
    /// Use the client at `binary`.
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl ShellConnector for SshCli {
    async fn connect(&self, host: &str, port: u16, user: &str) -> Result<Arc<dyn RemoteShell>, VboxError> {
        let session = SshSession {
            binary: self.binary.clone(),
            host: host.to_owned(),
            port,
            user: user.to_owned(),
        };
        session.run_command("true").await?;
        Ok(Arc::new(session))
    }
}

#[derive(Debug)]
struct SshSession {
    binary: PathBuf,
    host: String,
    port: u16,
    user: String,
}

impl SshSession {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(self.port.to_string())
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "ConnectTimeout=5"])
            .arg(format!("{}@{}", self.user, self.host))
            .kill_on_drop(true);
        cmd
    }

    fn failure(&self, what: &str, output: &std::process::Output) -> VboxError {
        VboxError::shell(
            format!("{}:{}", self.host, self.port),
            format!(
                "{what} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        )
    }
}

#[async_trait]
impl RemoteShell for SshSession {
    async fn run_script(&self, script: &str) -> Result<(), VboxError> {
        let mut child = self
            .command()
            .args(["sudo", "bash", "-s"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(self.failure("script", &output));
        }
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<(), VboxError> {
        self.run_command_output(command).await.map(drop)
    }

    async fn run_command_output(&self, command: &str) -> Result<String, VboxError> {
        tracing::debug!(host = %self.host, port = self.port, %command, "remote command");
        let output = self.command().arg(command).output().await?;
        if !output.status.success() {
            return Err(self.failure(command, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Artifact store over a pre-populated cache directory.
///
/// `https://host/a/b.iso` is looked up at `<root>/host/a/b.iso`; `file://`
/// URLs and plain paths are used as they are. Downloading is left to
/// whatever populates the cache.
#[derive(Debug, Clone)]
pub struct CacheDirStore {
    root: PathBuf,
}

impl CacheDirStore {
    /// Look artifacts up under `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Where the artifact for `url` is expected.
    #[must_use]
    pub fn path_for(&self, url: &str) -> PathBuf {
        if let Some(local) = url.strip_prefix("file://") {
            return PathBuf::from(local);
        }
        match url.split_once("://") {
            Some((_, rest)) => self.root.join(rest.trim_start_matches('/')),
            None => PathBuf::from(url),
        }
    }
}

#[async_trait]
impl ArtifactStore for CacheDirStore {
    async fn resolve(&self, url: &str) -> Result<PathBuf, VboxError> {
        let path = self.path_for(url);
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(VboxError::Artifact {
                url: url.to_owned(),
                reason: format!("not present in cache at {}", path.display()),
            })
        }
    }

    async fn unpack(&self, archive: &Path, into: &Path) -> Result<(), VboxError> {
        let output = Command::new("tar")
            .arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(into)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(VboxError::Artifact {
                url: archive.display().to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(())
    }
}

/// Packages seed media with `genisoimage`.
#[derive(Debug, Clone)]
pub struct IsoTool {
    binary: PathBuf,
}

impl Default for IsoTool {
    fn default() -> Self {
        Self::new(PathBuf::from("genisoimage"))
    }
}

impl IsoTool {
    /// Use the tool at `binary`.
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl MediaPackager for IsoTool {
    async fn package(&self, label: &str, files: &[(&str, &str)], target: &Path) -> Result<(), VboxError> {
        let staging = tempfile::tempdir()?;
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-output")
            .arg(target)
            .args(["-volid", label, "-joliet", "-rock"])
            .kill_on_drop(true);
        for (name, contents) in files {
            let path = staging.path().join(name);
            tokio::fs::write(&path, contents).await?;
            cmd.arg(path);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(VboxError::ExternalTool {
                command: format!("{} -output {}", self.binary.display(), target.display()),
                output: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_paths_mirror_url_layout() {
        let store = CacheDirStore::new(PathBuf::from("/cache"));
        assert_eq!(
            store.path_for("https://download.virtualbox.org/virtualbox/7.0.14/VBoxGuestAdditions_7.0.14.iso"),
            PathBuf::from("/cache/download.virtualbox.org/virtualbox/7.0.14/VBoxGuestAdditions_7.0.14.iso")
        );
        assert_eq!(store.path_for("file:///srv/images/jammy.vmdk"), PathBuf::from("/srv/images/jammy.vmdk"));
        assert_eq!(store.path_for("/srv/images/jammy.vmdk"), PathBuf::from("/srv/images/jammy.vmdk"));
    }

    #[tokio::test]
    async fn missing_artifact_is_reported_with_url() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let store = CacheDirStore::new(dir.path().to_path_buf());
        match store.resolve("https://example.org/disk.box").await {
            Err(VboxError::Artifact { url, .. }) => assert_eq!(url, "https://example.org/disk.box"),
            other => panic!("expected Artifact error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cached_artifact_resolves() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir: {e}"),
        };
        let expected = dir.path().join("example.org/disk.vmdk");
        if let Err(e) = std::fs::create_dir_all(dir.path().join("example.org")) {
            panic!("mkdir: {e}");
        }
        if let Err(e) = std::fs::write(&expected, b"disk") {
            panic!("write: {e}");
        }
        let store = CacheDirStore::new(dir.path().to_path_buf());
        match store.resolve("https://example.org/disk.vmdk").await {
            Ok(path) => assert_eq!(path, expected),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
