//! Remote execution transports.
//!
//! A [`RemoteRequest`] describes one call against a compute host. The
//! [`SystemExecutor`] carries it over the host's transport:
//!
//! - `Shell`: a command run over SSH (`virsh`, `qemu-img`)
//! - `Http`: a REST call, with basic auth or a cached session token
//! - `PowerShell`: a script run through `Invoke-Command` over WinRM

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::credentials::Credential;
use crate::error::{ControlError, Result};
use crate::types::{ConnectionDescriptor, TransportKind};

/// HTTP verbs used by REST adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// How an HTTP request authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAuth {
    /// Basic auth on every request
    Basic,
    /// Log in once with basic auth at `login_path` and send the returned
    /// token in `header` afterwards
    Session { login_path: String, header: String },
}

/// One remote call against a compute host.
#[derive(Debug, Clone)]
pub enum RemoteRequest {
    Shell {
        program: String,
        args: Vec<String>,
        stdin: Option<String>,
    },
    Http {
        method: HttpMethod,
        path: String,
        body: Option<Value>,
        auth: HttpAuth,
    },
    PowerShell {
        script: String,
    },
}

impl RemoteRequest {
    pub fn shell<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RemoteRequest::Shell {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    /// Feed `input` to the remote command's stdin. No effect on other kinds.
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        if let RemoteRequest::Shell { stdin, .. } = &mut self {
            *stdin = Some(input.into());
        }
        self
    }

    pub fn http(method: HttpMethod, path: impl Into<String>, auth: HttpAuth) -> Self {
        RemoteRequest::Http {
            method,
            path: path.into(),
            body: None,
            auth,
        }
    }

    /// Attach a JSON body. No effect on other kinds.
    pub fn with_body(mut self, value: Value) -> Self {
        if let RemoteRequest::Http { body, .. } = &mut self {
            *body = Some(value);
        }
        self
    }

    pub fn powershell(script: impl Into<String>) -> Self {
        RemoteRequest::PowerShell {
            script: script.into(),
        }
    }

    /// Transport this request needs.
    pub fn transport(&self) -> TransportKind {
        match self {
            RemoteRequest::Shell { .. } => TransportKind::Ssh,
            RemoteRequest::Http { .. } => TransportKind::Https,
            RemoteRequest::PowerShell { .. } => TransportKind::WinRm,
        }
    }

    /// One-line rendering for logs and scripted matching.
    pub fn describe(&self) -> String {
        match self {
            RemoteRequest::Shell { program, args, .. } => {
                let mut line = program.clone();
                for arg in args {
                    line.push(' ');
                    line.push_str(arg);
                }
                line
            }
            RemoteRequest::Http { method, path, .. } => format!("{} {}", method.as_str(), path),
            RemoteRequest::PowerShell { script } => script.clone(),
        }
    }
}

/// Result of a remote call.
///
/// For shell and PowerShell requests `status` is the exit code. For HTTP
/// requests it is the response status and `stdout` holds the body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    /// Exit code 0 with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Non-zero exit with the given stderr.
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// HTTP response with a body.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: status as i32,
            stdout: body.into(),
            stderr: String::new(),
        }
    }

    /// Exit code 0.
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// HTTP 2xx.
    pub fn http_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse stdout as JSON.
    pub fn json<T: DeserializeOwned>(&self, entity: &str) -> Result<T> {
        serde_json::from_str(&self.stdout).map_err(|e| {
            ControlError::internal(entity, format!("unexpected response from backend: {}", e))
        })
    }
}

/// Everything an executor needs to reach one host.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host_id: String,
    pub descriptor: ConnectionDescriptor,
    pub credential: Credential,
}

/// Carries remote requests to compute hosts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run one request. Transport failures are `BackendUnavailable`; a
    /// completed call with a failing status is returned as output.
    async fn execute(&self, target: &RemoteTarget, request: RemoteRequest) -> Result<RemoteOutput>;

    /// Drop cached per-host state (sessions) after a descriptor change.
    async fn invalidate(&self, _host_id: &str) {}
}

/// Environment variable carrying the WinRM password to `pwsh`.
const WINRM_PASSWORD_ENV: &str = "VDESK_WINRM_PASSWORD";

/// Executor backed by the local `ssh` and `pwsh` binaries and an HTTP client.
pub struct SystemExecutor {
    ssh_program: String,
    pwsh_program: String,
    connect_timeout: Duration,
    http: reqwest::Client,
    http_insecure: reqwest::Client,
    sessions: RwLock<HashMap<String, String>>,
}

impl SystemExecutor {
    /// Create an executor using `ssh` and `pwsh` from `PATH`.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let build = |insecure: bool| {
            reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .danger_accept_invalid_certs(insecure)
                .build()
                .map_err(|e| ControlError::configuration("http-client", e.to_string()))
        };

        Ok(Self {
            ssh_program: "ssh".to_string(),
            pwsh_program: "pwsh".to_string(),
            connect_timeout,
            http: build(false)?,
            http_insecure: build(true)?,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Override the binaries used for SSH and PowerShell.
    pub fn with_programs(mut self, ssh: impl Into<String>, pwsh: impl Into<String>) -> Self {
        self.ssh_program = ssh.into();
        self.pwsh_program = pwsh.into();
        self
    }

    async fn run_ssh(
        &self,
        target: &RemoteTarget,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<RemoteOutput> {
        let host = &target.host_id;
        let desc = &target.descriptor;
        let cred = &target.credential;

        if cred.key_path.is_none() && cred.password.is_some() {
            return Err(ControlError::configuration(
                host,
                "SSH transport requires key-based authentication",
            ));
        }

        let remote_command = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(&self.ssh_program);
        cmd.arg("-p")
            .arg(desc.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        if desc.flags.insecure_skip_verify {
            cmd.args(["-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null"]);
        }
        if let Some(key) = &cred.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", cred.username, desc.address))
            .arg("--")
            .arg(&remote_command);

        let output = spawn_and_collect(cmd, stdin, host, &self.ssh_program).await?;

        // ssh reserves 255 for its own connection and auth failures
        if output.status == 255 {
            return Err(ControlError::unavailable(
                host,
                format!("ssh failed: {}", output.stderr.trim()),
            ));
        }
        Ok(output)
    }

    async fn run_powershell(&self, target: &RemoteTarget, script: &str) -> Result<RemoteOutput> {
        let host = &target.host_id;
        let desc = &target.descriptor;
        let cred = &target.credential;

        let password = cred.password.as_deref().ok_or_else(|| {
            ControlError::configuration(host, "WinRM transport requires a password credential")
        })?;

        let (session_setup, session_arg) = if desc.flags.insecure_skip_verify {
            (
                "$opt = New-PSSessionOption -SkipCACheck -SkipCNCheck -SkipRevocationCheck\n",
                " -SessionOption $opt",
            )
        } else {
            ("", "")
        };
        let ssl = if desc.flags.tls { " -UseSSL" } else { "" };

        let wrapper = format!(
            "$ErrorActionPreference = 'Stop'\n\
             $secure = ConvertTo-SecureString $env:{env} -AsPlainText -Force\n\
             $cred = New-Object System.Management.Automation.PSCredential({user}, $secure)\n\
             {session_setup}\
             Invoke-Command -ComputerName {address} -Port {port}{ssl}{session_arg} -Credential $cred -ScriptBlock {{\n\
             {script}\n\
             }}\n",
            env = WINRM_PASSWORD_ENV,
            user = ps_quote(&cred.username),
            address = ps_quote(&desc.address),
            port = desc.port,
        );

        let mut cmd = Command::new(&self.pwsh_program);
        cmd.args(["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", "-"])
            .env(WINRM_PASSWORD_ENV, password);

        let output = spawn_and_collect(cmd, Some(&wrapper), host, &self.pwsh_program).await?;

        if !output.success() && is_winrm_transport_failure(&output.stderr) {
            return Err(ControlError::unavailable(
                host,
                format!("WinRM connection failed: {}", first_line(&output.stderr)),
            ));
        }
        Ok(output)
    }

    async fn run_http(
        &self,
        target: &RemoteTarget,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
        auth: &HttpAuth,
    ) -> Result<RemoteOutput> {
        let host = &target.host_id;
        let desc = &target.descriptor;
        let scheme = if desc.flags.tls { "https" } else { "http" };
        let base = format!("{}://{}:{}", scheme, desc.address, desc.port);
        let client = if desc.flags.insecure_skip_verify {
            &self.http_insecure
        } else {
            &self.http
        };

        match auth {
            HttpAuth::Basic => {
                let request = build_request(client, method, &format!("{}{}", base, path), body)
                    .basic_auth(&target.credential.username, target.credential.password.as_deref());
                send(request, host).await
            }
            HttpAuth::Session { login_path, header } => {
                let token = self.session_token(target, client, &base, login_path).await?;
                let request = build_request(client, method, &format!("{}{}", base, path), body)
                    .header(header.as_str(), token.as_str());
                let output = send(request, host).await?;
                if output.status != 401 {
                    return Ok(output);
                }

                debug!(host_id = %host, "Session rejected, logging in again");
                self.sessions.write().await.remove(host);
                let token = self.session_token(target, client, &base, login_path).await?;
                let request = build_request(client, method, &format!("{}{}", base, path), body)
                    .header(header.as_str(), token.as_str());
                send(request, host).await
            }
        }
    }

    async fn session_token(
        &self,
        target: &RemoteTarget,
        client: &reqwest::Client,
        base: &str,
        login_path: &str,
    ) -> Result<String> {
        let host = &target.host_id;
        if let Some(token) = self.sessions.read().await.get(host) {
            return Ok(token.clone());
        }

        let request = client
            .post(format!("{}{}", base, login_path))
            .basic_auth(&target.credential.username, target.credential.password.as_deref());
        let output = send(request, host).await?;
        if !output.http_success() {
            return Err(ControlError::unavailable(
                host,
                format!("login rejected with HTTP {}", output.status),
            ));
        }

        // vSphere returns the token as a JSON string
        let token = serde_json::from_str::<String>(&output.stdout)
            .unwrap_or_else(|_| output.stdout.trim().to_string());
        self.sessions.write().await.insert(host.clone(), token.clone());
        debug!(host_id = %host, "Session established");
        Ok(token)
    }
}

#[async_trait]
impl RemoteExecutor for SystemExecutor {
    #[instrument(skip(self, target, request), fields(host_id = %target.host_id))]
    async fn execute(&self, target: &RemoteTarget, request: RemoteRequest) -> Result<RemoteOutput> {
        if request.transport() != target.descriptor.transport {
            return Err(ControlError::configuration(
                &target.host_id,
                format!(
                    "host is configured for {:?} but the request needs {:?}",
                    target.descriptor.transport,
                    request.transport()
                ),
            ));
        }

        match &request {
            RemoteRequest::Shell { program, args, stdin } => {
                self.run_ssh(target, program, args, stdin.as_deref()).await
            }
            RemoteRequest::Http { method, path, body, auth } => {
                self.run_http(target, *method, path, body.as_ref(), auth).await
            }
            RemoteRequest::PowerShell { script } => self.run_powershell(target, script).await,
        }
    }

    async fn invalidate(&self, host_id: &str) {
        self.sessions.write().await.remove(host_id);
    }
}

fn build_request(
    client: &reqwest::Client,
    method: HttpMethod,
    url: &str,
    body: Option<&Value>,
) -> reqwest::RequestBuilder {
    let request = client.request(method.to_reqwest(), url);
    match body {
        Some(body) => request.json(body),
        None => request,
    }
}

async fn send(request: reqwest::RequestBuilder, host: &str) -> Result<RemoteOutput> {
    let response = request
        .send()
        .await
        .map_err(|e| ControlError::unavailable(host, format!("HTTP request failed: {}", e)))?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| ControlError::unavailable(host, format!("failed to read response: {}", e)))?;
    Ok(RemoteOutput::http(status, body))
}

async fn spawn_and_collect(
    mut cmd: Command,
    stdin: Option<&str>,
    host: &str,
    program: &str,
) -> Result<RemoteOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| ControlError::configuration(host, format!("failed to run {}: {}", program, e)))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        if let Err(e) = pipe.write_all(input.as_bytes()).await {
            warn!(host_id = %host, error = %e, "Failed to write remote stdin");
        }
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ControlError::unavailable(host, format!("{} did not complete: {}", program, e)))?;

    Ok(RemoteOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Quote one word for a POSIX shell.
pub(crate) fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Quote a string literal for PowerShell.
pub(crate) fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn is_winrm_transport_failure(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("connecting to remote server") || s.contains("winrm cannot complete the operation")
}

pub(crate) fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}
