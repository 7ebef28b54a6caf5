//! Orchestration session: the high-level lifecycle operations.
//!
//! A session owns every per-location resource: shell clients for the
//! master and worker hosts, the tunnel, the web and task clients and
//! the store client. The lifecycle operations compose them:
//! [`Session::deploy`] builds and ships the agent binaries,
//! [`Session::bring_up`] creates a job and assigns agents,
//! [`Session::bring_down`] drains, archives and cleans everything.
//!
//! Job creation is the one non-idempotent control-plane call. The
//! session gives each attempt a fresh timestamped name, issues the
//! creation exactly once per name, and reconciles an ambiguous outcome
//! by polling the management database for the name before retrying
//! under a new one. A half-created job can therefore never be
//! duplicated or leaked.

use std::{path::PathBuf, process::Stdio, sync::Arc};

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, LocationConfig},
    error::{Error, Result},
    job::{Job, JobHandle, JobState},
    retry::RetryPolicy,
    ssh::{Endpoint, ShellClient},
    store::{JobStore, SqlJobStore, StoreClient},
    tunnel::TunnelManager,
    web::{ControlClient, ReqwestTransport, TaskClient, WebRequest},
};

/// Shared per-location resources, owned by the session and borrowed by
/// job handles through an `Arc`.
pub(crate) struct Context {
    pub(crate) location: String,
    pub(crate) config: Config,
    pub(crate) loc: LocationConfig,
    pub(crate) master: Arc<ShellClient>,
    pub(crate) worker: Arc<ShellClient>,
    pub(crate) web: ControlClient,
    pub(crate) tasks: TaskClient,
    pub(crate) store: Arc<dyn JobStore>,
}

impl Context {
    pub(crate) fn view_url(&self, id: i64) -> String {
        format!("{}/projects/view/{id}", self.config.control.base_url)
    }

    pub(crate) fn create_url(&self) -> String {
        format!("{}/projects/createProject", self.config.control.base_url)
    }

    pub(crate) fn archive_url(&self, id: i64) -> String {
        format!("{}/projects/archive/{id}", self.config.control.base_url)
    }

    pub(crate) fn archive_progress_url(&self) -> String {
        format!("{}/progressArchiveFuzzjob", self.config.control.base_url)
    }

    pub(crate) fn agent_targets_url(&self, job_name: &str) -> String {
        format!(
            "{}/systems/configureFuzzjobInstances/{job_name}",
            self.config.control.base_url
        )
    }

    pub(crate) fn worker_pool_url(&self) -> String {
        format!(
            "{}/systems/configureSystemInstances/{}",
            self.config.control.base_url, self.loc.worker_name
        )
    }

    /// Directory on the worker holding the deployed agent binaries.
    pub(crate) fn agent_dir(&self) -> String {
        format!("{}/{}", self.config.remote.persistent_dir, self.loc.arch)
    }

    /// Run the fleet's apply-configuration task to completion.
    pub(crate) async fn apply_agents(&self) -> Result<()> {
        let handle = self.tasks.trigger().await?;
        self.tasks.wait_ok(handle).await
    }
}

/// A connected orchestration session for one location.
pub struct Session {
    ctx: Arc<Context>,
}

impl Session {
    /// Connect every client for `location` and verify the path to the
    /// control plane end to end.
    ///
    /// # Errors
    ///
    /// Fatal configuration and local-tooling errors; transient
    /// failures are retried inside the clients.
    pub async fn connect(config: Config, location: &str) -> Result<Self> {
        config.validate()?;
        let loc = config.location(location)?.clone();
        info!(location, "connecting");

        let master_ep = Endpoint::resolve(&loc.master_host, location).await?;
        let worker_ep = Endpoint::resolve(&loc.worker_host, location).await?;
        let master_addr = master_ep.address.clone();
        let master = Arc::new(ShellClient::open(master_ep, config.retry.clone())?);
        let worker = Arc::new(ShellClient::open(worker_ep, config.retry.clone())?);

        let tunnel = Arc::new(TunnelManager::new(
            location,
            Arc::clone(&master),
            &master_addr,
            &config.tunnel,
        ));
        tunnel.ensure_healthy().await?;

        let transport = Arc::new(ReqwestTransport::through_proxy(tunnel.proxy_addr())?);
        let web = ControlClient::new(
            location,
            transport.clone(),
            Arc::clone(&tunnel),
            config.retry.clone(),
        );
        let tasks = TaskClient::new(
            location,
            transport,
            Arc::clone(&tunnel),
            config.retry.clone(),
            &config.control.task_url,
            config.control.task_project,
            config.control.task_id,
            &config.control.task_user,
            &config.control.task_password,
        );
        let store: Arc<dyn JobStore> = Arc::new(SqlJobStore::new(
            StoreClient::new(
                location,
                &master_addr,
                config.store.port,
                &config.store.user,
                &config.store.password,
                config.retry.clone(),
            ),
            &config.store.management_db,
        ));

        // Warm-up request proves the whole tunnel + web path works.
        web.call(&WebRequest::get(&config.control.base_url), None)
            .await?;
        info!(location, "connected");

        Ok(Self {
            ctx: Arc::new(Context {
                location: location.into(),
                config,
                loc,
                master,
                worker,
                web,
                tasks,
                store,
            }),
        })
    }

    /// Location tag this session is connected to.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.ctx.location
    }

    /// Release the store connection and the shell control sockets. The
    /// tunnel stays up for the next session.
    pub async fn close(&self) {
        self.ctx.store.close().await;
        self.ctx.master.close().await;
        self.ctx.worker.close().await;
        info!(location = %self.ctx.location, "closed");
    }

    /// Build the agent binaries locally and ship them to the worker.
    ///
    /// # Errors
    ///
    /// `Build` if any local build step fails; fatal local errors
    /// propagate from the transfer.
    pub async fn deploy(&self, clean: bool) -> Result<()> {
        let build = &self.ctx.config.build;
        let source = expand_home(&build.source_dir);
        info!(location = %self.ctx.location, "deploying");

        if clean {
            let stale = source.join(&build.clean_dir);
            debug!(path = %stale.display(), "removing previous build");
            match tokio::fs::remove_dir_all(&stale).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::LocalFile {
                        path: stale,
                        message: e.to_string(),
                    })
                }
            }
        }

        run_local(&build.command, &source.join(&build.build_workdir)).await?;

        let artifact_dir = source.join(&build.artifact_dir);
        run_local(
            &[
                "zip".into(),
                "-r".into(),
                build.artifact_name.clone(),
                ".".into(),
            ],
            &artifact_dir,
        )
        .await?;

        let archive = artifact_dir.join(&build.artifact_name);
        let remote = format!("{}/{}", self.ctx.agent_dir(), build.artifact_name);
        self.ctx.worker.put(&archive, &remote).await?;
        self.ctx
            .worker
            .exec(
                &format!(
                    "cd {} && unzip -o {}",
                    self.ctx.agent_dir(),
                    build.artifact_name
                ),
                true,
            )
            .await?;
        info!(location = %self.ctx.location, "deployed");
        Ok(())
    }

    /// Create a fresh job and bring its agents up.
    ///
    /// # Errors
    ///
    /// Fatal local errors only; everything else is retried.
    pub async fn bring_up(&self) -> Result<JobHandle> {
        info!(location = %self.ctx.location, "bringing up");
        for command in &self.ctx.config.remote.tuning_commands {
            self.ctx.worker.exec(command, true).await?;
        }
        let job = self.create_job().await?;
        self.set_worker_pool(1).await?;
        let campaign = &self.ctx.config.campaign;
        let mut handle = JobHandle::new(
            Arc::clone(&self.ctx),
            job,
            JobState::Created,
            campaign.generators,
        );
        handle
            .set_agents(campaign.generators, campaign.runners, campaign.evaluators)
            .await?;
        info!(location = %self.ctx.location, job = %handle.job().name, "up");
        Ok(handle)
    }

    /// Drain, archive and clean up every job at this location.
    /// Idempotent: a location with no jobs comes out the same way.
    ///
    /// # Errors
    ///
    /// Fatal local errors only.
    pub async fn bring_down(&self) -> Result<()> {
        info!(location = %self.ctx.location, "bringing down");
        let jobs = self.list_jobs().await?;
        let mut handles: Vec<JobHandle> = jobs
            .into_iter()
            .map(|job| JobHandle::new(Arc::clone(&self.ctx), job, JobState::Active, 0))
            .collect();

        for handle in &mut handles {
            handle.set_agents(0, 0, 0).await?;
        }
        self.set_worker_pool(0).await?;

        // Agents that ignored the drain get killed outright. pkill
        // finding nothing is fine.
        self.ctx
            .worker
            .exec(&format!("pkill -f '{}/' || true", self.ctx.agent_dir()), false)
            .await?;

        for handle in &mut handles {
            handle.archive().await?;
        }

        let dir = self.ctx.agent_dir();
        self.ctx
            .worker
            .exec(&format!("rm -rf {dir}/logs {dir}/testcaseFiles"), true)
            .await?;
        info!(location = %self.ctx.location, "down");
        Ok(())
    }

    /// Full refresh: tear down, redeploy, bring back up.
    ///
    /// # Errors
    ///
    /// Same as the individual phases.
    pub async fn refresh(&self, clean: bool) -> Result<JobHandle> {
        self.bring_down().await?;
        self.deploy(clean).await?;
        self.bring_up().await
    }

    /// Every job the management database knows about.
    ///
    /// # Errors
    ///
    /// Fatal local errors only.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.ctx.store.list_jobs().await
    }

    /// A handle for an already existing job.
    #[must_use]
    pub fn handle(&self, job: Job) -> JobHandle {
        JobHandle::new(
            Arc::clone(&self.ctx),
            job,
            JobState::Active,
            self.ctx.config.campaign.generators,
        )
    }

    /// Set the worker's pool-manager count and apply.
    async fn set_worker_pool(&self, count: u32) -> Result<()> {
        debug!(location = %self.ctx.location, count, "setting worker pool");
        let request = WebRequest::post(self.ctx.worker_pool_url())
            .text("localManager_lm", count.to_string())
            .text("localManager_lm_arch", self.ctx.loc.arch.clone());
        self.ctx.web.call(&request, Some("Success!")).await?;
        self.ctx.apply_agents().await
    }

    async fn create_job(&self) -> Result<Job> {
        let campaign = &self.ctx.config.campaign;
        let control = &self.ctx.config.control;
        let remote = &self.ctx.config.remote;

        // Read every local file once, up front; retries must never
        // re-read local state.
        let module = tokio::fs::read(&campaign.target_module)
            .await
            .map_err(|e| Error::LocalFile {
                path: PathBuf::from(&campaign.target_module),
                message: e.to_string(),
            })?;
        let mut seeds = Vec::with_capacity(campaign.seeds.len());
        for seed in &campaign.seeds {
            let bytes = tokio::fs::read(seed).await.map_err(|e| Error::LocalFile {
                path: PathBuf::from(seed),
                message: e.to_string(),
            })?;
            seeds.push(bytes);
        }

        let target_command = format!("{}/{}", remote.sut_dir, campaign.target_command_line);
        let module_name = file_name(&campaign.target_module);
        let build_request = |name: &str| {
            let mut request = WebRequest::post(self.ctx.create_url())
                .text("name", name)
                .text("subtype", control.job_subtype.clone());
            for weight in &control.generator_weights {
                request = request.text("generatorTypes", weight.to_string());
            }
            for weight in &control.evaluator_weights {
                request = request.text("evaluatorTypes", weight.to_string());
            }
            request = request
                .text("location", self.ctx.location.clone())
                .text("targetCMDLine", target_command.clone())
                .text("option_module", "hangeTimeout")
                .text("option_module_value", control.hang_timeout_ms.to_string())
                .file("targetModulesOnCreate", module_name.clone(), module.clone())
                .text("targetFile", "");
            for bytes in &seeds {
                request = request.file("filename", "seed", bytes.clone());
            }
            request.text("basicBlockFile", "")
        };

        create_job_with(
            &self.ctx.web,
            self.ctx.store.as_ref(),
            build_request,
            &self.ctx.config.retry,
            &campaign.name_prefix,
            &self.ctx.config.store.job_db_prefix,
        )
        .await
    }
}

/// Exactly-once job creation. Each pass mints a fresh timestamped
/// name, issues the creation once, and on an ambiguous outcome polls
/// the management database for that name before giving up on it. Only
/// a name proven absent is retired.
pub(crate) async fn create_job_with<F>(
    web: &ControlClient,
    lookup: &dyn JobStore,
    build_request: F,
    policy: &RetryPolicy,
    name_prefix: &str,
    db_prefix: &str,
) -> Result<Job>
where
    F: Fn(&str) -> WebRequest,
{
    let mut backoff = policy.backoff();
    loop {
        let name = format!("{name_prefix}{}", Utc::now().timestamp());
        debug!(name = %name, "creating job");
        match web.call_once(&build_request(&name), Some("Success")).await {
            Ok(response) => {
                if let Some(id) = response.id_after("/view/") {
                    info!(name = %name, id, "job created");
                    return Ok(Job::new(id, &name, db_prefix));
                }
                warn!(name = %name, "creation succeeded without redirect id");
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(name = %name, error = %e, "job creation attempt failed"),
        }
        // The request may have landed despite the failure. Poll for
        // the name before retiring it.
        let mut settle = policy.backoff();
        for _ in 0..policy.attempts_before_escalation {
            if let Some(id) = lookup.find_job(&name).await? {
                info!(name = %name, id, "job found during reconciliation");
                return Ok(Job::new(id, &name, db_prefix));
            }
            settle.wait().await;
        }
        debug!(name = %name, "name proven absent, retrying with a new one");
        backoff.wait().await;
    }
}

async fn run_local(command: &[String], workdir: &std::path::Path) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        return Err(Error::InvalidConfig("empty build command".into()));
    };
    debug!(command = ?command, workdir = %workdir.display(), "running local step");
    let status = Command::new(program)
        .args(args)
        .current_dir(workdir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| Error::Spawn {
            command: command.join(" "),
            source: e,
        })?;
    if !status.success() {
        return Err(Error::Build {
            command: command.join(" "),
            message: format!("exit status {status}"),
        });
    }
    Ok(())
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map_or_else(|| path.to_string(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::{
        ssh::tests::{endpoint, ScriptedConnector},
        web::{
            tests::{ok_response, test_tunnel, MockTransport},
            Transport, WebResponse,
        },
    };

    /// Store with no jobs at all; doubles as the lookup that never
    /// finds a name.
    struct EmptyStore;

    #[async_trait]
    impl JobStore for EmptyStore {
        async fn list_jobs(&self) -> Result<Vec<Job>> {
            Ok(Vec::new())
        }

        async fn find_job(&self, _name: &str) -> Result<Option<i64>> {
            Ok(None)
        }

        async fn count_rows(&self, _db: &str, _sql: &str) -> Result<u64> {
            Ok(0)
        }

        async fn close(&self) {}
    }

    struct FoundAs {
        id: i64,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for FoundAs {
        async fn list_jobs(&self) -> Result<Vec<Job>> {
            Ok(Vec::new())
        }

        async fn find_job(&self, _name: &str) -> Result<Option<i64>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(Some(self.id))
        }

        async fn count_rows(&self, _db: &str, _sql: &str) -> Result<u64> {
            Ok(0)
        }

        async fn close(&self) {}
    }

    type Commands = Arc<Mutex<Vec<String>>>;

    /// A session wired to scripted shell hosts and the given transport
    /// and store, plus the command logs of the worker and master.
    fn test_session(
        transport: &Arc<MockTransport>,
        store: Arc<dyn JobStore>,
    ) -> (Session, Commands, Commands) {
        let config = Config {
            retry: RetryPolicy::immediate(),
            ..Config::default()
        };
        let loc = LocationConfig {
            master_host: "master5".into(),
            worker_host: "worker5".into(),
            worker_name: "fleet-1021-5-Linux1".into(),
            arch: "x64".into(),
        };
        let master_connector = ScriptedConnector::new(0);
        let master_commands = Arc::clone(&master_connector.commands);
        let master = Arc::new(ShellClient::with_connector(
            endpoint(),
            RetryPolicy::immediate(),
            Box::new(master_connector),
        ));
        let worker_connector = ScriptedConnector::new(0);
        let worker_commands = Arc::clone(&worker_connector.commands);
        let worker = Arc::new(ShellClient::with_connector(
            endpoint(),
            RetryPolicy::immediate(),
            Box::new(worker_connector),
        ));
        let tasks = TaskClient::new(
            "1021-5",
            Arc::clone(transport) as Arc<dyn Transport>,
            test_tunnel(),
            RetryPolicy::immediate(),
            "http://tasks.fleet:8888/api/v2",
            1,
            3,
            "admin",
            "admin",
        );
        let session = Session {
            ctx: Arc::new(Context {
                location: "1021-5".into(),
                config,
                loc,
                master,
                worker,
                web: web(Arc::clone(transport)),
                tasks,
                store,
            }),
        };
        (session, worker_commands, master_commands)
    }

    fn created_response(id: i64) -> WebResponse {
        WebResponse {
            status: 200,
            body: "Success".into(),
            final_url: format!("http://web.fleet:8880/projects/view/{id}"),
        }
    }

    fn web(transport: Arc<MockTransport>) -> ControlClient {
        ControlClient::new(
            "1021-5",
            transport,
            test_tunnel(),
            RetryPolicy::immediate(),
        )
    }

    #[tokio::test]
    async fn test_create_job_takes_id_from_redirect() {
        let transport = Arc::new(MockTransport::new(0, created_response(31)));
        let job = create_job_with(
            &web(Arc::clone(&transport)),
            &EmptyStore,
            |name| WebRequest::post("u").text("name", name),
            &RetryPolicy::immediate(),
            "bench",
            "fleet_",
        )
        .await
        .expect("create");
        assert_eq!(job.id, 31);
        assert!(job.name.starts_with("bench"));
        assert_eq!(job.db_name, format!("fleet_{}", job.name));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_job_reconciles_ambiguous_failure() {
        // Transport fails; the creation actually landed, so the lookup
        // finds the name and no second creation is issued.
        let transport = Arc::new(MockTransport::new(5, created_response(31)));
        let lookup = FoundAs {
            id: 42,
            lookups: AtomicUsize::new(0),
        };
        let job = create_job_with(
            &web(Arc::clone(&transport)),
            &lookup,
            |name| WebRequest::post("u").text("name", name),
            &RetryPolicy::immediate(),
            "bench",
            "fleet_",
        )
        .await
        .expect("create");
        assert_eq!(job.id, 42);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(lookup.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_job_retires_failed_name_and_retries() {
        // Two failed attempts whose names are proven absent, then a
        // success. Each pass issues exactly one creation request.
        let transport = Arc::new(MockTransport::new(2, created_response(31)));
        let job = create_job_with(
            &web(Arc::clone(&transport)),
            &EmptyStore,
            |name| WebRequest::post("u").text("name", name),
            &RetryPolicy::immediate(),
            "bench",
            "fleet_",
        )
        .await
        .expect("create");
        assert_eq!(job.id, 31);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bring_down_with_no_jobs_is_idempotent() {
        // Responses cycle per pass: pool-zero form, task trigger,
        // task status poll.
        let transport = Arc::new(MockTransport::scripted(
            0,
            vec![
                ok_response("Success!"),
                ok_response(r#"{"history_id": 7}"#),
                ok_response(r#"{"status": "OK"}"#),
            ],
        ));
        let (session, worker_commands, _) = test_session(&transport, Arc::new(EmptyStore));

        session.bring_down().await.expect("first bring-down");
        session.bring_down().await.expect("second bring-down");

        // No jobs means no agent-target forms and no archive calls:
        // three web calls per pass, nothing more.
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 6);
        let commands = worker_commands.lock().await.clone();
        assert_eq!(commands.len(), 4);
        assert!(commands[0].contains("pkill -f"));
        assert!(commands[1].starts_with("rm -rf"));
        assert_eq!(commands[2], commands[0]);
        assert_eq!(commands[3], commands[1]);
    }

    #[tokio::test]
    async fn test_fetch_dump_removes_remote_copy_only_when_asked() {
        let transport = Arc::new(MockTransport::new(0, ok_response("unused")));
        let (session, _, master_commands) = test_session(&transport, Arc::new(EmptyStore));
        let handle = session.handle(Job::with_db(9, "bench1", "fleet_bench1"));

        handle
            .fetch_dump(Path::new("/tmp/bench1.sql.gz"), false)
            .await
            .expect("fetch");
        assert!(master_commands.lock().await.is_empty());

        handle
            .fetch_dump(Path::new("/tmp/bench1.sql.gz"), true)
            .await
            .expect("fetch with clean");
        let commands = master_commands.lock().await.clone();
        assert_eq!(
            commands,
            ["rm /srv/fleet/data/ftp/files/archive/fleet_bench1.sql.gz"]
        );
    }

    #[test]
    fn test_expand_home_only_rewrites_tilde_prefix() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_home("~/fleet"), PathBuf::from(home).join("fleet"));
        }
    }

    #[test]
    fn test_file_name_strips_directories() {
        assert_eq!(file_name("/a/b/fuzzgoat"), "fuzzgoat");
        assert_eq!(file_name("fuzzgoat"), "fuzzgoat");
    }
}
