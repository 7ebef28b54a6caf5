//! Retrying remote shell and file-transfer client.
//!
//! Each [`ShellClient`] keeps one persistent OpenSSH connection (a
//! ControlMaster socket) to its endpoint. Any failed operation tears
//! the connection down and reconnects before retrying, with exponential
//! backoff and no attempt limit: campaigns run for days and must ride
//! out transient network blips. Callers are expected to issue only
//! idempotent or naturally safe-to-repeat commands.
//!
//! Only fatal local errors (a binary that cannot be spawned, a missing
//! upload file) propagate out of the retry loops.

use std::{
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
};

/// A named remote host. Resolution happens once, at session creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// SSH alias the client connects with.
    pub alias: String,
    /// Resolved network address.
    pub address: String,
    /// Location tag, carried for logging.
    pub location: String,
}

impl Endpoint {
    /// Resolve an SSH alias to its concrete address with `ssh -G`.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if `ssh` is missing, cannot be spawned,
    /// or reports no hostname for the alias.
    pub async fn resolve(alias: &str, location: &str) -> Result<Self> {
        let ssh = find_binary("ssh")?;
        let output = Command::new(&ssh)
            .args(["-G", alias])
            .output()
            .await
            .map_err(|e| spawn_error(&ssh, e))?;
        if !output.status.success() {
            return Err(Error::Resolve {
                alias: alias.into(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let address = stdout
            .lines()
            .find_map(|line| line.strip_prefix("hostname "))
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| Error::Resolve {
                alias: alias.into(),
                message: "ssh -G reported no hostname".into(),
            })?;
        Ok(Self {
            alias: alias.into(),
            address: address.into(),
            location: location.into(),
        })
    }
}

/// Captured output of a remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Remote standard output.
    pub stdout: String,
    /// Remote standard error.
    pub stderr: String,
    /// Remote exit code.
    pub exit_code: i32,
}

impl ExecOutput {
    /// True when the remote command exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One live connection to an endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a command remotely, capturing its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput>;
    /// Copy a remote file to a local path.
    async fn get(&self, remote: &str, local: &Path) -> Result<()>;
    /// Copy a local file to a remote path.
    async fn put(&self, local: &Path, remote: &str) -> Result<()>;
    /// Tear the connection down. Best effort.
    async fn close(&self);
}

/// Factory recreating connections after a failure.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a fresh connection.
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// Retrying shell/file client bound to one endpoint.
pub struct ShellClient {
    endpoint: Endpoint,
    policy: RetryPolicy,
    connector: Box<dyn Connector>,
    connection: Mutex<Option<Box<dyn Connection>>>,
}

impl ShellClient {
    /// Open a client backed by the system OpenSSH binaries.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if `ssh` or `scp` is not installed.
    pub fn open(endpoint: Endpoint, policy: RetryPolicy) -> Result<Self> {
        let connector = OpenSshConnector::new(&endpoint)?;
        Ok(Self::with_connector(endpoint, policy, Box::new(connector)))
    }

    /// Open a client with a custom connector. Used by tests and by the
    /// tunnel manager's probe harness.
    #[must_use]
    pub fn with_connector(
        endpoint: Endpoint,
        policy: RetryPolicy,
        connector: Box<dyn Connector>,
    ) -> Self {
        Self {
            endpoint,
            policy,
            connector,
            connection: Mutex::new(None),
        }
    }

    /// The endpoint this client talks to.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Run a command remotely, retrying until it can be executed.
    ///
    /// With `require_success`, a non-zero remote exit is treated like a
    /// transport failure: reconnect, back off, run again.
    ///
    /// # Errors
    ///
    /// Only fatal local errors propagate.
    pub async fn exec(&self, command: &str, require_success: bool) -> Result<ExecOutput> {
        let mut backoff = self.policy.backoff();
        loop {
            match self.try_exec(command).await {
                Ok(output) if !require_success || output.success() => return Ok(output),
                Ok(output) => {
                    warn!(
                        location = %self.endpoint.location,
                        host = %self.endpoint.alias,
                        exit_code = output.exit_code,
                        stderr = %output.stderr.trim(),
                        "remote command `{command}` failed"
                    );
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        location = %self.endpoint.location,
                        host = %self.endpoint.alias,
                        error = %e,
                        "error executing `{command}`"
                    );
                }
            }
            self.disconnect().await;
            backoff.wait().await;
        }
    }

    /// Copy a remote file to a local path, retrying until it succeeds.
    ///
    /// # Errors
    ///
    /// Only fatal local errors propagate.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        let mut backoff = self.policy.backoff();
        loop {
            match self.try_get(remote, local).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        location = %self.endpoint.location,
                        host = %self.endpoint.alias,
                        error = %e,
                        "error fetching `{remote}`"
                    );
                }
            }
            self.disconnect().await;
            backoff.wait().await;
        }
    }

    /// Copy a local file to a remote path, retrying until it succeeds.
    ///
    /// # Errors
    ///
    /// Fatal if the local file is missing; otherwise only fatal local
    /// errors propagate.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        if !local.is_file() {
            return Err(Error::LocalFile {
                path: local.to_path_buf(),
                message: "missing local file for upload".into(),
            });
        }
        let mut backoff = self.policy.backoff();
        loop {
            match self.try_put(local, remote).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        location = %self.endpoint.location,
                        host = %self.endpoint.alias,
                        error = %e,
                        "error uploading to `{remote}`"
                    );
                }
            }
            self.disconnect().await;
            backoff.wait().await;
        }
    }

    /// Tear down the persistent connection. The next operation
    /// reconnects transparently; sessions call this on teardown.
    pub async fn close(&self) {
        self.disconnect().await;
    }

    async fn try_exec(&self, command: &str) -> Result<ExecOutput> {
        let mut guard = self.connection.lock().await;
        let connection = Self::ensure_connected(&self.endpoint, &*self.connector, &mut *guard).await?;
        connection.exec(command).await
    }

    async fn try_get(&self, remote: &str, local: &Path) -> Result<()> {
        let mut guard = self.connection.lock().await;
        let connection = Self::ensure_connected(&self.endpoint, &*self.connector, &mut *guard).await?;
        connection.get(remote, local).await
    }

    async fn try_put(&self, local: &Path, remote: &str) -> Result<()> {
        let mut guard = self.connection.lock().await;
        let connection = Self::ensure_connected(&self.endpoint, &*self.connector, &mut *guard).await?;
        connection.put(local, remote).await
    }

    async fn ensure_connected<'a>(
        endpoint: &Endpoint,
        connector: &dyn Connector,
        guard: &'a mut Option<Box<dyn Connection>>,
    ) -> Result<&'a dyn Connection> {
        if guard.is_none() {
            debug!(
                location = %endpoint.location,
                host = %endpoint.alias,
                "connecting"
            );
            *guard = Some(connector.connect().await?);
        }
        guard.as_deref().ok_or_else(|| Error::Remote {
            host: endpoint.alias.clone(),
            message: "connection unavailable".into(),
        })
    }

    async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await;
        }
    }
}

/// Connector backed by the system `ssh`/`scp` binaries, multiplexing
/// everything over one ControlMaster socket per endpoint.
struct OpenSshConnector {
    ssh: PathBuf,
    scp: PathBuf,
    alias: String,
    control_path: PathBuf,
}

impl OpenSshConnector {
    fn new(endpoint: &Endpoint) -> Result<Self> {
        let control_path = std::env::temp_dir().join(format!(
            "fuzzfleet-{}-{}.ctl",
            endpoint.alias,
            std::process::id()
        ));
        Ok(Self {
            ssh: find_binary("ssh")?,
            scp: find_binary("scp")?,
            alias: endpoint.alias.clone(),
            control_path,
        })
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let output = Command::new(&self.ssh)
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-o", "ControlMaster=auto", "-o", "ControlPersist=yes"])
            .args(["-o", "BatchMode=yes", "-fN"])
            .arg(&self.alias)
            .output()
            .await
            .map_err(|e| spawn_error(&self.ssh, e))?;
        if !output.status.success() {
            return Err(remote_error(&self.alias, &output));
        }
        Ok(Box::new(OpenSshConnection {
            ssh: self.ssh.clone(),
            scp: self.scp.clone(),
            alias: self.alias.clone(),
            control_path: self.control_path.clone(),
        }))
    }
}

struct OpenSshConnection {
    ssh: PathBuf,
    scp: PathBuf,
    alias: String,
    control_path: PathBuf,
}

impl OpenSshConnection {
    fn control_arg(&self) -> String {
        format!("ControlPath={}", self.control_path.display())
    }
}

// ssh reports its own transport failures as exit code 255; those are
// connection problems, not remote command results.
const SSH_TRANSPORT_FAILURE: i32 = 255;

#[async_trait]
impl Connection for OpenSshConnection {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let output = Command::new(&self.ssh)
            .arg("-o")
            .arg(self.control_arg())
            .args(["-o", "BatchMode=yes"])
            .arg(&self.alias)
            .arg("--")
            .arg(command)
            .output()
            .await
            .map_err(|e| spawn_error(&self.ssh, e))?;
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == SSH_TRANSPORT_FAILURE {
            return Err(remote_error(&self.alias, &output));
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<()> {
        let output = Command::new(&self.scp)
            .arg("-o")
            .arg(self.control_arg())
            .args(["-o", "BatchMode=yes", "-q"])
            .arg(format!("{}:{remote}", self.alias))
            .arg(local)
            .output()
            .await
            .map_err(|e| spawn_error(&self.scp, e))?;
        if !output.status.success() {
            return Err(remote_error(&self.alias, &output));
        }
        Ok(())
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let output = Command::new(&self.scp)
            .arg("-o")
            .arg(self.control_arg())
            .args(["-o", "BatchMode=yes", "-q"])
            .arg(local)
            .arg(format!("{}:{remote}", self.alias))
            .output()
            .await
            .map_err(|e| spawn_error(&self.scp, e))?;
        if !output.status.success() {
            return Err(remote_error(&self.alias, &output));
        }
        Ok(())
    }

    async fn close(&self) {
        // Ask the control master to exit; the socket may already be
        // gone, which is fine.
        let _ = Command::new(&self.ssh)
            .arg("-o")
            .arg(self.control_arg())
            .args(["-O", "exit"])
            .arg(&self.alias)
            .output()
            .await;
    }
}

fn find_binary(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| Error::MissingBinary { name: name.into() })
}

fn spawn_error(program: &Path, source: std::io::Error) -> Error {
    Error::Spawn {
        command: program.display().to_string(),
        source,
    }
}

fn remote_error(alias: &str, output: &Output) -> Error {
    Error::Remote {
        host: alias.into(),
        message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    /// Scripted connector: each connect yields a connection that fails
    /// a preset number of operations before succeeding.
    pub(crate) struct ScriptedConnector {
        failures: Arc<AtomicUsize>,
        pub connects: Arc<AtomicUsize>,
        pub commands: Arc<Mutex<Vec<String>>>,
        exit_code: i32,
    }

    impl ScriptedConnector {
        pub(crate) fn new(failures: usize) -> Self {
            Self {
                failures: Arc::new(AtomicUsize::new(failures)),
                connects: Arc::new(AtomicUsize::new(0)),
                commands: Arc::new(Mutex::new(Vec::new())),
                exit_code: 0,
            }
        }

        fn failing_exits(failures: usize, exit_code: i32) -> Self {
            Self {
                exit_code,
                ..Self::new(failures)
            }
        }
    }

    struct ScriptedConnection {
        failures: Arc<AtomicUsize>,
        commands: Arc<Mutex<Vec<String>>>,
        exit_code: i32,
    }

    impl ScriptedConnection {
        fn take_failure(&self) -> bool {
            self.failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedConnection {
                failures: Arc::clone(&self.failures),
                commands: Arc::clone(&self.commands),
                exit_code: self.exit_code,
            }))
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn exec(&self, command: &str) -> Result<ExecOutput> {
            self.commands.lock().await.push(command.to_string());
            if self.take_failure() {
                return Err(Error::Remote {
                    host: "scripted".into(),
                    message: "injected failure".into(),
                });
            }
            Ok(ExecOutput {
                stdout: "ok".into(),
                stderr: String::new(),
                exit_code: self.exit_code,
            })
        }

        async fn get(&self, _remote: &str, _local: &Path) -> Result<()> {
            if self.take_failure() {
                return Err(Error::Remote {
                    host: "scripted".into(),
                    message: "injected failure".into(),
                });
            }
            Ok(())
        }

        async fn put(&self, _local: &Path, _remote: &str) -> Result<()> {
            if self.take_failure() {
                return Err(Error::Remote {
                    host: "scripted".into(),
                    message: "injected failure".into(),
                });
            }
            Ok(())
        }

        async fn close(&self) {}
    }

    pub(crate) fn endpoint() -> Endpoint {
        Endpoint {
            alias: "worker5".into(),
            address: "10.0.0.5".into(),
            location: "1021-5".into(),
        }
    }

    pub(crate) fn scripted_client(failures: usize) -> (ShellClient, Arc<AtomicUsize>) {
        let connector = ScriptedConnector::new(failures);
        let connects = Arc::clone(&connector.connects);
        let client =
            ShellClient::with_connector(endpoint(), RetryPolicy::immediate(), Box::new(connector));
        (client, connects)
    }

    #[tokio::test]
    async fn test_exec_returns_after_transient_failures() {
        let (client, connects) = scripted_client(2);
        let output = client.exec("uptime", false).await.expect("exec");
        assert!(output.success());
        // Initial connect plus one reconnect per failure.
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exec_succeeds_first_try_without_reconnect() {
        let (client, connects) = scripted_client(0);
        client.exec("uptime", false).await.expect("exec");
        client.exec("uptime", false).await.expect("exec");
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exec_without_require_success_returns_nonzero_exit() {
        let connector = ScriptedConnector::failing_exits(0, 1);
        let client =
            ShellClient::with_connector(endpoint(), RetryPolicy::immediate(), Box::new(connector));
        let output = client.exec("pkill -f agents", false).await.expect("exec");
        assert_eq!(output.exit_code, 1);
    }

    #[tokio::test]
    async fn test_get_retries_until_success() {
        let (client, connects) = scripted_client(1);
        client
            .get("/srv/dump.sql.gz", Path::new("/tmp/dump.sql.gz"))
            .await
            .expect("get");
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_put_missing_local_file_is_fatal() {
        let (client, connects) = scripted_client(0);
        let err = client
            .put(Path::new("/nonexistent/artifact.zip"), "/tmp/artifact.zip")
            .await
            .expect_err("put should fail");
        assert!(err.is_fatal());
        // Never even tried to connect.
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_put_existing_file_retries_through() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let (client, connects) = scripted_client(2);
        client
            .put(file.path(), "/tmp/artifact.zip")
            .await
            .expect("put");
        assert_eq!(connects.load(Ordering::SeqCst), 3);
    }
}
