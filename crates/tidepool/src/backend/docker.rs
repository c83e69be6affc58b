//! Docker-compatible container engine backend.
//!
//! One container per session, kept alive with `tail -f /dev/null`. Files move
//! through the engine's archive endpoints, commands run through exec with
//! demultiplexed stdout/stderr, and listing, stat and deletion run `find`,
//! `mkdir` and `rm` inside the container.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, DownloadFromContainerOptionsBuilder,
    InspectContainerOptions, RemoveContainerOptionsBuilder, StartContainerOptions,
    UploadToContainerOptionsBuilder,
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};

use super::archive::{self, HEADER_SLACK};
use super::listing;
use super::{BackendError, SandboxBackend};
use crate::limits::LimitedBuffer;
use crate::paths;
use crate::session::{
    CodeSession, ExecRequest, ExecResult, FileContent, FileEntry, FileType, SessionConfig,
    SessionKey, SessionStatus, new_session_id,
};

/// Label marking containers owned by this backend.
pub const LABEL_SANDBOX: &str = "tidepool.sandbox";
/// Label holding the rendered session key.
pub const LABEL_SESSION_KEY: &str = "tidepool.session.key";
/// Label holding the session id.
pub const LABEL_SESSION_ID: &str = "tidepool.session.id";

/// Deadline for the filesystem primitives run on behalf of file operations.
const PRIMITIVE_TIMEOUT: Duration = Duration::from_secs(30);
/// Output ceiling for filesystem primitives.
const PRIMITIVE_OUTPUT_BYTES: u64 = 8 * 1024 * 1024;

/// Backend over a Docker-compatible engine.
#[derive(Clone)]
pub struct DockerBackend {
    docker: Docker,
}

impl fmt::Debug for DockerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerBackend").finish_non_exhaustive()
    }
}

impl DockerBackend {
    /// Connect using the local defaults (`DOCKER_HOST` or the default socket).
    pub fn connect() -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the engine answers.
    pub async fn ping(&self) -> Result<(), BackendError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| BackendError::Unavailable(e.to_string()))
    }

    async fn ensure_image(&self, image: &str) -> Result<(), BackendError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let (from_image, tag) = split_image_tag(image);
        tracing::info!(image, "pulling sandbox image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| engine_error("pull image", e))?;
        Ok(())
    }

    /// Run a filesystem primitive and require it to succeed, unless the path
    /// is missing, which maps to [`BackendError::FileNotFound`].
    async fn primitive(
        &self,
        handle: &str,
        operation: &'static str,
        path: &str,
        argv: Vec<String>,
    ) -> Result<ExecResult, BackendError> {
        let request = ExecRequest::argv(argv)
            .with_timeout(PRIMITIVE_TIMEOUT)
            .with_max_output_bytes(PRIMITIVE_OUTPUT_BYTES);
        let result = self.exec(handle, &request).await?;
        if result.timed_out {
            return Err(BackendError::Primitive {
                operation,
                exit_code: -1,
                stderr: format!("timed out after {}s", PRIMITIVE_TIMEOUT.as_secs()),
            });
        }
        if result.exit_code != 0 {
            if listing::reports_missing(&result.stderr) {
                return Err(BackendError::FileNotFound(path.to_string()));
            }
            // find reports unreadable subdirectories but still lists the rest.
            if operation == "list" && !result.stdout.is_empty() {
                return Ok(result);
            }
            return Err(BackendError::Primitive {
                operation,
                exit_code: result.exit_code,
                stderr: result.stderr_lossy().trim().to_string(),
            });
        }
        Ok(result)
    }

    async fn stat(&self, handle: &str, path: &str) -> Result<FileEntry, BackendError> {
        let result = self
            .primitive(handle, "stat", path, listing::stat_argv(path))
            .await?;
        listing::parse_records(&result.stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::FileNotFound(path.to_string()))
    }
}

/// Split `repo[:tag]`, leaving registry ports alone.
fn split_image_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

/// Container name for a session: readable, unique, and within the engine's charset.
fn container_name(key: &SessionKey) -> String {
    let readable: String = format!("{}-{}-{}", key.scope, key.scope_id, key.name)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(48)
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("tidepool-{readable}-{}", &suffix[..8])
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Exec against a stopped container answers 409.
fn is_not_running(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

fn engine_error(operation: &'static str, error: BollardError) -> BackendError {
    match error {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => BackendError::Engine {
            operation,
            message: format!("{status_code}: {message}"),
        },
        other => BackendError::Unavailable(format!("{operation}: {other}")),
    }
}

fn handle_error(operation: &'static str, handle: &str, error: BollardError) -> BackendError {
    if is_not_found(&error) || is_not_running(&error) {
        BackendError::SessionNotFound(handle.to_string())
    } else {
        engine_error(operation, error)
    }
}

fn env_list(env: impl IntoIterator<Item = (String, String)>) -> Vec<String> {
    env.into_iter().map(|(k, v)| format!("{k}={v}")).collect()
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_session(
        &self,
        key: &SessionKey,
        config: &SessionConfig,
    ) -> Result<CodeSession, BackendError> {
        let image = config.resolved_image();
        self.ensure_image(&image).await?;

        let id = new_session_id();
        let name = container_name(key);
        let workdir = paths::normalize(config.resolved_workdir());
        let labels = HashMap::from([
            (LABEL_SANDBOX.to_string(), "true".to_string()),
            (LABEL_SESSION_KEY.to_string(), key.to_string()),
            (LABEL_SESSION_ID.to_string(), id.clone()),
        ]);
        let limits = &config.limits;
        let body = ContainerCreateBody {
            image: Some(image.clone()),
            cmd: Some(vec!["tail".into(), "-f".into(), "/dev/null".into()]),
            working_dir: Some(workdir.clone()),
            env: Some(env_list(config.env.clone())),
            labels: Some(labels),
            tty: Some(false),
            host_config: Some(HostConfig {
                network_mode: Some(if config.allow_network { "bridge" } else { "none" }.into()),
                memory: (limits.max_memory_bytes > 0)
                    .then(|| i64::try_from(limits.max_memory_bytes).unwrap_or(i64::MAX)),
                nano_cpus: (limits.nano_cpus > 0)
                    .then(|| i64::try_from(limits.nano_cpus).unwrap_or(i64::MAX)),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await
            .map_err(|e| engine_error("create container", e))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            // Leave nothing behind for a session that never existed.
            let _ = self.destroy_session(&created.id).await;
            return Err(engine_error("start container", e));
        }

        tracing::info!(
            container = %created.id,
            name = %name,
            image = %image,
            session_key = %key,
            "sandbox container started"
        );

        let now = Utc::now();
        Ok(CodeSession {
            id,
            container_handle: created.id,
            key: key.clone(),
            config: SessionConfig {
                workdir,
                ..config.clone()
            },
            status: SessionStatus::Ready,
            created_at: now,
            last_used_at: now,
        })
    }

    async fn destroy_session(&self, handle: &str) -> Result<(), BackendError> {
        match self
            .docker
            .remove_container(
                handle,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(()) => {
                tracing::debug!(container = %handle, "sandbox container removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(engine_error("remove container", e)),
        }
    }

    async fn get_session(&self, handle: &str) -> Result<CodeSession, BackendError> {
        let info = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|e| handle_error("inspect container", handle, e))?;

        let running = info
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            return Err(BackendError::SessionNotFound(handle.to_string()));
        }

        let container_config = info.config.unwrap_or_default();
        let labels = container_config.labels.unwrap_or_default();
        let key = labels
            .get(LABEL_SESSION_KEY)
            .and_then(|rendered| SessionKey::parse(rendered))
            .ok_or_else(|| BackendError::SessionNotFound(handle.to_string()))?;
        let env = container_config
            .env
            .unwrap_or_default()
            .into_iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        let allow_network = info
            .host_config
            .and_then(|host| host.network_mode)
            .is_some_and(|mode| mode != "none");
        let created_at = info
            .created
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

        Ok(CodeSession {
            id: labels.get(LABEL_SESSION_ID).cloned().unwrap_or_default(),
            container_handle: info.id.unwrap_or_else(|| handle.to_string()),
            key,
            config: SessionConfig {
                image: container_config.image,
                allow_network,
                workdir: container_config.working_dir.unwrap_or_default(),
                env,
                ..SessionConfig::default()
            },
            status: SessionStatus::Ready,
            created_at,
            last_used_at: created_at,
        })
    }

    async fn exec(&self, handle: &str, request: &ExecRequest) -> Result<ExecResult, BackendError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + request.timeout;
        let limit = usize::try_from(request.max_output_bytes).unwrap_or(usize::MAX);
        let mut stdout = LimitedBuffer::new(limit);
        let mut stderr = LimitedBuffer::new(limit);

        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            cmd: Some(request.command.to_argv()),
            env: (!request.env.is_empty()).then(|| env_list(request.env.clone())),
            working_dir: request.workdir.clone(),
            ..ExecConfig::default()
        };
        let exec = self
            .docker
            .create_exec(handle, config)
            .await
            .map_err(|e| handle_error("create exec", handle, e))?;

        let started_exec = tokio::time::timeout_at(
            deadline,
            self.docker.start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    output_capacity: None,
                }),
            ),
        )
        .await;

        let mut timed_out = false;
        match started_exec {
            Err(_) => timed_out = true,
            Ok(Err(e)) => return Err(handle_error("start exec", handle, e)),
            Ok(Ok(StartExecResults::Detached)) => {
                return Err(BackendError::Engine {
                    operation: "start exec",
                    message: "engine detached an attached exec".into(),
                });
            }
            Ok(Ok(StartExecResults::Attached { mut output, .. })) => loop {
                match tokio::time::timeout_at(deadline, output.next()).await {
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Ok(LogOutput::StdOut { message }))) => {
                        stdout.write(&message);
                    }
                    Ok(Some(Ok(LogOutput::StdErr { message }))) => {
                        stderr.write(&message);
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => return Err(engine_error("read exec output", e)),
                }
            },
        }

        let exit_code = if timed_out {
            // The process keeps running in the container; only the wait is abandoned.
            tracing::debug!(
                container = %handle,
                timeout_ms = request.timeout.as_millis() as u64,
                "exec timed out"
            );
            -1
        } else {
            self.docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| handle_error("inspect exec", handle, e))?
                .exit_code
                .unwrap_or(-1)
        };

        let truncated = stdout.was_truncated() || stderr.was_truncated();
        Ok(ExecResult {
            exit_code,
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
            duration: started.elapsed(),
            timed_out,
            truncated,
        })
    }

    async fn write_file(
        &self,
        handle: &str,
        path: &str,
        content: &[u8],
        mode: u32,
    ) -> Result<(), BackendError> {
        let path = paths::normalize(path);
        let parent = paths::parent(&path);
        let name = paths::file_name(&path);
        if name.is_empty() {
            return Err(BackendError::IsADirectory(path.clone()));
        }

        if parent != "/" {
            self.primitive(handle, "mkdir", parent, listing::mkdir_argv(parent))
                .await?;
        }

        let tarball = archive::single_file(name, content, mode)?;
        self.docker
            .upload_to_container(
                handle,
                Some(UploadToContainerOptionsBuilder::new().path(parent).build()),
                bollard::body_full(tarball.into()),
            )
            .await
            .map_err(|e| handle_error("upload archive", handle, e))?;

        tracing::debug!(container = %handle, path = %path, bytes = content.len(), "file written");
        Ok(())
    }

    async fn read_file(
        &self,
        handle: &str,
        path: &str,
        max_bytes: Option<u64>,
    ) -> Result<FileContent, BackendError> {
        let path = paths::normalize(path);
        let entry = self.stat(handle, &path).await?;
        if entry.file_type != FileType::File {
            return Err(BackendError::NotAFile(path));
        }
        let truncated = max_bytes.is_some_and(|max| entry.size_bytes > max);

        // Stop pulling once the header and the kept prefix are in hand.
        let budget = max_bytes.map(|max| {
            usize::try_from(max)
                .unwrap_or(usize::MAX)
                .saturating_add(HEADER_SLACK)
        });
        let mut stream = std::pin::pin!(self.docker.download_from_container(
            handle,
            Some(DownloadFromContainerOptionsBuilder::new().path(&path).build()),
        ));
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| match e {
                e if is_not_found(&e) => BackendError::FileNotFound(path.clone()),
                e => handle_error("download archive", handle, e),
            })?;
            buffer.extend_from_slice(&chunk);
            if budget.is_some_and(|budget| buffer.len() >= budget) {
                break;
            }
        }

        let file = archive::first_file(&buffer, &path, max_bytes)?;
        Ok(FileContent {
            data: file.data,
            size_bytes: entry.size_bytes.max(file.size),
            truncated,
        })
    }

    async fn list_files(
        &self,
        handle: &str,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<FileEntry>, BackendError> {
        let path = paths::normalize(path);
        let result = self
            .primitive(handle, "list", &path, listing::list_argv(&path, recursive))
            .await?;
        listing::parse_records(&result.stdout)
    }

    async fn delete_file(
        &self,
        handle: &str,
        path: &str,
        recursive: bool,
    ) -> Result<(), BackendError> {
        let path = paths::normalize(path);
        let entry = self.stat(handle, &path).await?;
        if entry.file_type == FileType::Directory && !recursive {
            return Err(BackendError::IsADirectory(path));
        }
        self.primitive(
            handle,
            "remove",
            &path,
            listing::remove_argv(&path, recursive),
        )
        .await?;
        tracing::debug!(container = %handle, path = %path, recursive, "path removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Scope;

    #[test]
    fn test_split_image_tag() {
        assert_eq!(split_image_tag("python:3.11-slim"), ("python", "3.11-slim"));
        assert_eq!(split_image_tag("ubuntu"), ("ubuntu", "latest"));
        assert_eq!(
            split_image_tag("localhost:5000/tools"),
            ("localhost:5000/tools", "latest")
        );
        assert_eq!(
            split_image_tag("localhost:5000/tools:1.2"),
            ("localhost:5000/tools", "1.2")
        );
    }

    #[test]
    fn test_container_name_charset() {
        let key = SessionKey::named(Scope::Workflow, "run/1:α", "my session");
        let name = container_name(&key);
        assert!(name.starts_with("tidepool-workflow-run-1--"));
        assert!(
            name.chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
        );
    }

    #[test]
    fn test_container_names_are_unique() {
        let key = SessionKey::agent("a");
        assert_ne!(container_name(&key), container_name(&key));
    }

    #[test]
    fn test_not_found_classification() {
        let missing = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(matches!(
            handle_error("create exec", "abc", missing),
            BackendError::SessionNotFound(_)
        ));

        let conflict = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(matches!(
            handle_error("create exec", "abc", conflict),
            BackendError::Engine { .. }
        ));
    }

    #[test]
    fn test_env_list() {
        let env = env_list([("A".to_string(), "1".to_string())]);
        assert_eq!(env, vec!["A=1"]);
    }
}
