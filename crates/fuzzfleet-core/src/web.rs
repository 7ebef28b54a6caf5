//! Retrying control-plane and task-execution clients.
//!
//! The control plane is a flaky web application reached through the
//! tunnel. A call fails in four ways, all treated the same: transport
//! error, backend-unavailable sentinel embedded in the body, non-2xx
//! status, or a missing expected success marker. The client retries a
//! short inner budget with backoff; when that budget is exhausted it
//! assumes the tunnel itself died, asks the tunnel manager to repair
//! it, and starts the inner loop again. [`ControlClient::call`] either
//! returns a successful response or keeps retrying for as long as the
//! process lives.
//!
//! Job creation is the one call that is not safe to repeat blindly;
//! [`ControlClient::call_once`] exposes a single attempt for it and the
//! session reconciles by name afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
    tunnel::TunnelManager,
};

/// Sentinel the control plane embeds in otherwise-200 responses when
/// its own database connection is down.
pub const BACKEND_UNAVAILABLE: &str = "Error: Database connection failed";

/// HTTP method of a control-plane call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// GET request.
    #[default]
    Get,
    /// POST request.
    Post,
}

/// One part of a multipart form body.
#[derive(Debug, Clone)]
pub enum FormPart {
    /// Plain text field.
    Text {
        /// Field name.
        name: String,
        /// Field value.
        value: String,
    },
    /// File upload field. Bytes are read once, up front, so retries
    /// never re-read local files.
    File {
        /// Field name.
        name: String,
        /// File name presented to the server.
        file_name: String,
        /// File contents.
        bytes: Vec<u8>,
    },
}

/// A control-plane request, rebuilt from these parts on every attempt.
#[derive(Debug, Clone, Default)]
pub struct WebRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Multipart form parts; empty for a bare request.
    pub form: Vec<FormPart>,
    /// Optional basic-auth credentials.
    pub auth: Option<(String, String)>,
}

impl WebRequest {
    /// A GET request.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            ..Self::default()
        }
    }

    /// A POST request.
    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            ..Self::default()
        }
    }

    /// Append a text form field.
    #[must_use]
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Append a file form field.
    #[must_use]
    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.form.push(FormPart::File {
            name: name.into(),
            file_name: file_name.into(),
            bytes,
        });
        self
    }

    /// Attach basic-auth credentials.
    #[must_use]
    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((user.into(), password.into()));
        self
    }
}

/// A raw control-plane response.
#[derive(Debug, Clone)]
pub struct WebResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
    /// URL after redirects; job creation encodes the new id here.
    pub final_url: String,
}

impl WebResponse {
    /// True for 2xx statuses.
    #[must_use]
    pub const fn ok_status(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Numeric id following `marker` in the final URL, if any.
    /// The creation redirect ends in `/view/<id>`.
    #[must_use]
    pub fn id_after(&self, marker: &str) -> Option<i64> {
        let (_, rest) = self.final_url.split_once(marker)?;
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }
}

/// Transport seam: sends one request, once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and capture the response.
    async fn send(&self, request: &WebRequest) -> Result<WebResponse>;
}

/// Production transport: reqwest through the location's SOCKS proxy.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport whose every request goes through the SOCKS
    /// forwarder at `proxy_addr`. Remote DNS (`socks5h`) is required:
    /// control-plane names only resolve inside the management network.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the proxy address is unusable.
    pub fn through_proxy(proxy_addr: &str) -> Result<Self> {
        let proxy = reqwest::Proxy::all(format!("socks5h://{proxy_addr}"))
            .map_err(|e| Error::InvalidConfig(format!("bad proxy address `{proxy_addr}`: {e}")))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("cannot build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &WebRequest) -> Result<WebResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        if let Some((user, password)) = &request.auth {
            builder = builder.basic_auth(user, Some(password));
        }
        if !request.form.is_empty() {
            let mut form = reqwest::multipart::Form::new();
            for part in &request.form {
                form = match part {
                    FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
                    FormPart::File {
                        name,
                        file_name,
                        bytes,
                    } => form.part(
                        name.clone(),
                        reqwest::multipart::Part::bytes(bytes.clone())
                            .file_name(file_name.clone()),
                    ),
                };
            }
            builder = builder.multipart(form);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Http(format!("reading body: {e}")))?;
        Ok(WebResponse {
            status,
            body,
            final_url,
        })
    }
}

/// Retrying client for the control-plane web application.
pub struct ControlClient {
    location: String,
    transport: Arc<dyn Transport>,
    tunnel: Arc<TunnelManager>,
    policy: RetryPolicy,
}

impl ControlClient {
    /// Create a client for one location.
    #[must_use]
    pub fn new(
        location: &str,
        transport: Arc<dyn Transport>,
        tunnel: Arc<TunnelManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            location: location.into(),
            transport,
            tunnel,
            policy,
        }
    }

    /// Issue the request until it succeeds. By construction this never
    /// returns a retryable failure: it returns the response or keeps
    /// retrying, repairing the tunnel whenever an inner retry budget
    /// exhausts.
    ///
    /// # Errors
    ///
    /// Only fatal local errors propagate.
    pub async fn call(&self, request: &WebRequest, expect: Option<&str>) -> Result<WebResponse> {
        loop {
            let mut backoff = self.policy.backoff();
            for _ in 0..self.policy.attempts_before_escalation {
                match self.call_once(request, expect).await {
                    Ok(response) => return Ok(response),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(
                            location = %self.location,
                            url = %request.url,
                            error = %e,
                            "control-plane request failed"
                        );
                    }
                }
                backoff.wait().await;
            }
            // Persistent failure usually means the tunnel died under us.
            error!(
                location = %self.location,
                url = %request.url,
                attempts = self.policy.attempts_before_escalation,
                "retry budget exhausted, checking tunnel"
            );
            self.tunnel.ensure_healthy().await?;
        }
    }

    /// A single attempt, for calls that are not safe to repeat.
    ///
    /// # Errors
    ///
    /// Returns a retryable `Http` error on transport failure, a
    /// backend-unavailable sentinel, a non-2xx status, or a missing
    /// `expect` marker.
    pub async fn call_once(
        &self,
        request: &WebRequest,
        expect: Option<&str>,
    ) -> Result<WebResponse> {
        let response = self.transport.send(request).await?;
        if response.body.contains(BACKEND_UNAVAILABLE) {
            return Err(Error::Http("control-plane backend unavailable".into()));
        }
        if !response.ok_status() {
            return Err(Error::Http(format!("status {}", response.status)));
        }
        if let Some(marker) = expect {
            if !response.body.contains(marker) {
                return Err(Error::Http(format!(
                    "marker `{marker}` not found in response"
                )));
            }
        }
        Ok(response)
    }
}

/// Status of an asynchronous task-execution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Queued, not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Ok,
    /// Finished with an error.
    Error,
}

impl TaskStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "OK" => Self::Ok,
            "ERROR" | "error" => Self::Error,
            "RUN" | "running" => Self::Running,
            _ => Self::Pending,
        }
    }
}

/// Handle to one triggered task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(pub u64);

/// Client for the task-execution API used to apply fleet configuration
/// changes. Shares the control client's retry and escalation behavior.
pub struct TaskClient {
    inner: ControlClient,
    base_url: String,
    project: u64,
    task: u64,
    user: String,
    password: String,
    policy: RetryPolicy,
}

impl TaskClient {
    /// Create a client for one location's task API.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        location: &str,
        transport: Arc<dyn Transport>,
        tunnel: Arc<TunnelManager>,
        policy: RetryPolicy,
        base_url: &str,
        project: u64,
        task: u64,
        user: &str,
        password: &str,
    ) -> Self {
        Self {
            inner: ControlClient::new(location, transport, tunnel, policy.clone()),
            base_url: base_url.into(),
            project,
            task,
            user: user.into(),
            password: password.into(),
            policy,
        }
    }

    /// Start a run of the apply-configuration task.
    ///
    /// # Errors
    ///
    /// Only fatal local errors propagate; malformed responses are
    /// retried.
    pub async fn trigger(&self) -> Result<TaskHandle> {
        let url = format!(
            "{}/project/{}/periodic_task/{}/execute/",
            self.base_url, self.project, self.task
        );
        let request = WebRequest::post(url).basic_auth(&self.user, &self.password);
        let mut backoff = self.policy.backoff();
        loop {
            let response = self.inner.call(&request, None).await?;
            match Self::history_id(&response.body) {
                Some(id) => {
                    debug!(location = %self.inner.location, history = id, "task triggered");
                    return Ok(TaskHandle(id));
                }
                None => {
                    warn!(
                        location = %self.inner.location,
                        body = %response.body,
                        "task trigger response missing history_id"
                    );
                }
            }
            backoff.wait().await;
        }
    }

    /// Fetch the current status of a run.
    ///
    /// # Errors
    ///
    /// Only fatal local errors propagate.
    pub async fn poll(&self, handle: TaskHandle) -> Result<TaskStatus> {
        let url = format!(
            "{}/project/{}/history/{}",
            self.base_url, self.project, handle.0
        );
        let request = WebRequest::get(url).basic_auth(&self.user, &self.password);
        let response = self.inner.call(&request, None).await?;
        let status = serde_json::from_str::<serde_json::Value>(&response.body)
            .ok()
            .and_then(|v| v.get("status").and_then(|s| s.as_str().map(TaskStatus::parse)))
            .unwrap_or(TaskStatus::Pending);
        Ok(status)
    }

    /// Block until a run of the task finishes successfully. A run that
    /// ends in error is logged and replaced by a fresh trigger; the
    /// task is an idempotent configuration apply.
    ///
    /// # Errors
    ///
    /// Only fatal local errors propagate.
    pub async fn wait_ok(&self, handle: TaskHandle) -> Result<()> {
        let mut handle = handle;
        loop {
            match self.poll(handle).await? {
                TaskStatus::Ok => return Ok(()),
                TaskStatus::Error => {
                    warn!(
                        location = %self.inner.location,
                        history = handle.0,
                        "task run failed, retriggering"
                    );
                    handle = self.trigger().await?;
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }
            tokio::time::sleep(self.policy.base_delay()).await;
        }
    }

    fn history_id(body: &str) -> Option<u64> {
        serde_json::from_str::<serde_json::Value>(body)
            .ok()?
            .get("history_id")?
            .as_u64()
    }
}
