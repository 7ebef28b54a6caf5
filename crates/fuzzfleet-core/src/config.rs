//! Configuration loading and validation.
//!
//! All tunables live in one [`Config`] loaded from TOML. The struct is
//! constructed once and passed into [`Session::connect`]; nothing in
//! this crate reads process-wide state.
//!
//! [`Session::connect`]: crate::session::Session::connect

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    controller::ControllerConfig,
    error::{Error, Result},
    retry::RetryPolicy,
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Fleet locations keyed by their tag (e.g. `"1021-5"`).
    pub locations: BTreeMap<String, LocationConfig>,
    /// Control-plane and task-execution API settings.
    pub control: ControlConfig,
    /// Persistent-store connection settings.
    pub store: StoreConfig,
    /// Remote filesystem layout on the fleet hosts.
    pub remote: RemotePaths,
    /// Local build/package pipeline for `deploy`.
    pub build: BuildConfig,
    /// Tunnel probe/repair settings.
    pub tunnel: TunnelConfig,
    /// Backoff policy shared by every retrying client.
    pub retry: RetryPolicy,
    /// Adaptive concurrency controller settings.
    pub controller: ControllerConfig,
    /// Default campaign brought up by the CLI.
    pub campaign: CampaignConfig,
}

/// One fleet deployment unit: control-plane install, worker host and
/// master (archive + database) host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocationConfig {
    /// SSH alias of the master host. Doubles as the jump host for the
    /// management-network tunnel.
    pub master_host: String,
    /// SSH alias of the worker host running agents.
    pub worker_host: String,
    /// Worker name as registered with the control plane.
    pub worker_name: String,
    /// Architecture tag used in agent-count forms.
    pub arch: String,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            master_host: String::new(),
            worker_host: String::new(),
            worker_name: String::new(),
            arch: "x64".into(),
        }
    }
}

/// Control-plane web application and task-execution API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlConfig {
    /// Base URL of the control-plane web application, reached through
    /// the tunnel.
    pub base_url: String,
    /// Base URL of the task-execution API.
    pub task_url: String,
    /// Project id owning the apply-configuration periodic task.
    pub task_project: u64,
    /// Id of the apply-configuration periodic task.
    pub task_id: u64,
    /// Task API basic-auth user.
    pub task_user: String,
    /// Task API basic-auth password.
    pub task_password: String,
    /// Job subtype submitted on creation.
    pub job_subtype: String,
    /// Per-mutator generator weights, in the control plane's fixed
    /// order.
    pub generator_weights: Vec<u32>,
    /// Evaluator weights, in the control plane's fixed order.
    pub evaluator_weights: Vec<u32>,
    /// Hang timeout option submitted on creation, in milliseconds.
    pub hang_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            base_url: "http://web.fleet:8880".into(),
            task_url: "http://tasks.fleet:8888/api/v2".into(),
            task_project: 1,
            task_id: 3,
            task_user: "admin".into(),
            task_password: "admin".into(),
            job_subtype: "X64_Lin_DynRioSingle".into(),
            generator_weights: vec![100, 0, 0, 0, 0, 0],
            evaluator_weights: vec![100],
            hang_timeout_ms: 5000,
        }
    }
}

/// Persistent-store connection settings. The server runs on each
/// location's master host; one database instance exists per job, plus
/// a management database listing jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Database user.
    pub user: String,
    /// Database password.
    pub password: String,
    /// Server port.
    pub port: u16,
    /// Management database holding the job table.
    pub management_db: String,
    /// Prefix prepended to a job name to form its database name.
    pub job_db_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            user: "fleet_gm".into(),
            password: "fleet_gm".into(),
            port: 3306,
            management_db: "fleet_gm".into(),
            job_db_prefix: "fleet_".into(),
        }
    }
}

/// Remote filesystem layout on the fleet hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemotePaths {
    /// Root of the per-arch agent installation on the worker.
    pub persistent_dir: String,
    /// Directory holding targets under test.
    pub sut_dir: String,
    /// Directory on the master where archived job dumps land.
    pub dump_dir: String,
    /// Host-tuning commands run on the worker before a job starts.
    /// Empty by default; anything listed must succeed.
    pub tuning_commands: Vec<String>,
}

impl Default for RemotePaths {
    fn default() -> Self {
        Self {
            persistent_dir: "/home/fleet_user/fleet/persistent".into(),
            sut_dir: "/home/fleet_user/fleet/persistent/SUT".into(),
            dump_dir: "/srv/fleet/data/ftp/files/archive".into(),
            tuning_commands: Vec::new(),
        }
    }
}

/// Local build/package pipeline for `deploy`. Every step is fatal on
/// failure; builds are not safely retryable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    /// Checkout of the agent sources on the local machine.
    pub source_dir: String,
    /// Output directory removed before a clean build, relative to
    /// `source_dir`.
    pub clean_dir: String,
    /// Build command, run inside `build_workdir`.
    pub command: Vec<String>,
    /// Working directory for the build command, relative to
    /// `source_dir`.
    pub build_workdir: String,
    /// Directory whose contents are zipped and shipped, relative to
    /// `source_dir`.
    pub artifact_dir: String,
    /// Name of the zip placed on the worker.
    pub artifact_name: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            source_dir: "~/fleet".into(),
            clean_dir: "core/x86-64".into(),
            command: vec!["sudo".into(), "./buildAll.sh".into()],
            build_workdir: "build/ubuntu_based".into(),
            artifact_dir: "core/x86-64/bin".into(),
            artifact_name: "agents.zip".into(),
        }
    }
}

/// Tunnel probe/repair settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelConfig {
    /// Port of the SOCKS forwarder on the jump host.
    pub port: u16,
    /// Raw-connect probe timeout, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Delay between repairing the tunnel and re-probing it, in
    /// milliseconds.
    pub settle_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            port: 6969,
            probe_timeout_ms: 3000,
            settle_ms: 1000,
        }
    }
}

/// Parameters of the campaign the CLI brings up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CampaignConfig {
    /// Job names are this prefix plus a creation timestamp, which keeps
    /// them unique within a location.
    pub name_prefix: String,
    /// Target command line, relative to the remote SUT directory.
    pub target_command_line: String,
    /// Local path of the target binary uploaded on creation.
    pub target_module: String,
    /// Local paths of seed files uploaded on creation.
    pub seeds: Vec<String>,
    /// Initial generator count.
    pub generators: u32,
    /// Initial runner count.
    pub runners: u32,
    /// Initial evaluator count.
    pub evaluators: u32,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            name_prefix: String::new(),
            target_command_line: String::new(),
            target_module: String::new(),
            seeds: Vec::new(),
            generators: 2,
            runners: 10,
            evaluators: 10,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read, is not valid
    /// TOML, or fails validation.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on the first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        for (tag, location) in &self.locations {
            if location.master_host.is_empty()
                || location.worker_host.is_empty()
                || location.worker_name.is_empty()
            {
                return Err(Error::InvalidConfig(format!(
                    "location `{tag}` must set master_host, worker_host and worker_name"
                )));
            }
        }
        if self.control.base_url.is_empty() || self.control.task_url.is_empty() {
            return Err(Error::InvalidConfig(
                "control.base_url and control.task_url must be set".into(),
            ));
        }
        if self.control.generator_weights.is_empty() || self.control.evaluator_weights.is_empty() {
            return Err(Error::InvalidConfig(
                "control weights must contain at least one entry".into(),
            ));
        }
        if self.tunnel.port == 0 {
            return Err(Error::InvalidConfig("tunnel.port must be non-zero".into()));
        }
        self.retry.validate()?;
        self.controller.validate()?;
        Ok(())
    }

    /// Look up a location by tag.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an unknown tag.
    pub fn location(&self, tag: &str) -> Result<&LocationConfig> {
        self.locations
            .get(tag)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown location `{tag}`")))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn one_location() -> Config {
        let mut config = Config::default();
        config.locations.insert(
            "1021-5".into(),
            LocationConfig {
                master_host: "master5".into(),
                worker_host: "worker5".into(),
                worker_name: "fleet-1021-5-Linux1".into(),
                arch: "x64".into(),
            },
        );
        config
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_populated_location_validates() {
        assert!(one_location().validate().is_ok());
    }

    #[test]
    fn test_incomplete_location_rejected() {
        let mut config = Config::default();
        config
            .locations
            .insert("1021-5".into(), LocationConfig::default());
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_tunnel_port_rejected() {
        let mut config = one_location();
        config.tunnel.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_location_lookup_fails() {
        let config = one_location();
        assert!(config.location("1021-5").is_ok());
        assert!(config.location("1021-9").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = one_location();
        let raw = toml::to_string(&config).expect("serialize");
        let parsed: Config = toml::from_str(&raw).expect("parse");
        assert_eq!(config, parsed);
    }

    #[tokio::test]
    async fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"
[locations.1021-6]
master_host = "master6"
worker_host = "worker6"
worker_name = "fleet-1021-6-Linux1"

[tunnel]
port = 7070
"#
        )
        .expect("write");
        let config = Config::load(file.path()).await.expect("load");
        assert_eq!(config.tunnel.port, 7070);
        assert_eq!(config.tunnel.probe_timeout_ms, 3000);
        assert_eq!(config.locations["1021-6"].arch, "x64");
        assert_eq!(config.retry.attempts_before_escalation, 3);
    }

    #[tokio::test]
    async fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "not toml [").expect("write");
        assert!(Config::load(file.path()).await.is_err());
    }
}
