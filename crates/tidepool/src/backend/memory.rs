//! In-process backend.
//!
//! Sandboxes are plain in-memory file trees. Commands are answered by a small
//! set of builtins (`echo`, `cat`, `sleep`, ...) or by an installed
//! [`ExecHandler`]. Useful for tests and for running the tool surface on a
//! machine without a container engine.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BackendError, SandboxBackend};
use crate::limits::LimitedBuffer;
use crate::paths;
use crate::session::{
    CodeSession, ExecRequest, ExecResult, FileContent, FileEntry, FileType, SessionConfig,
    SessionKey, SessionStatus, new_session_id,
};

/// Raw output of a command before limits are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CannedOutput {
    /// Exit code
    pub exit_code: i64,
    /// Standard output
    pub stdout: Vec<u8>,
    /// Standard error
    pub stderr: Vec<u8>,
}

impl CannedOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(exit_code: i64, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }
}

/// Answers commands for a [`MemoryBackend`].
///
/// Returning `None` falls through to the builtins.
#[async_trait]
pub trait ExecHandler: Send + Sync {
    /// Handle a command run in the sandbox `handle`.
    async fn exec(&self, handle: &str, request: &ExecRequest) -> Option<CannedOutput>;
}

#[async_trait]
impl<F> ExecHandler for F
where
    F: Fn(&ExecRequest) -> Option<CannedOutput> + Send + Sync,
{
    async fn exec(&self, _handle: &str, request: &ExecRequest) -> Option<CannedOutput> {
        self(request)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir {
        modified: DateTime<Utc>,
    },
    File {
        data: Vec<u8>,
        modified: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct MemorySandbox {
    session: CodeSession,
    nodes: BTreeMap<String, Node>,
}

impl MemorySandbox {
    fn new(session: CodeSession) -> Self {
        let mut sandbox = Self {
            session,
            nodes: BTreeMap::new(),
        };
        sandbox.nodes.insert("/".to_string(), Node::Dir { modified: Utc::now() });
        let workdir = paths::normalize(sandbox.session.config.resolved_workdir());
        // A fresh sandbox always has a working directory.
        let _ = sandbox.mkdir_all(&workdir);
        sandbox
    }

    fn mkdir_all(&mut self, path: &str) -> Result<(), BackendError> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.nodes.get(&current) {
                Some(Node::Dir { .. }) => {}
                Some(Node::File { .. }) => {
                    return Err(BackendError::Primitive {
                        operation: "mkdir",
                        exit_code: 1,
                        stderr: format!("mkdir: cannot create directory '{path}': Not a directory"),
                    });
                }
                None => {
                    self.nodes
                        .insert(current.clone(), Node::Dir { modified: Utc::now() });
                }
            }
        }
        Ok(())
    }

    fn descendants<'a>(&'a self, path: &'a str) -> impl Iterator<Item = (&'a String, &'a Node)> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(key, _)| key.starts_with(&prefix))
            .filter(move |(key, _)| key.as_str() != path)
    }
}

/// Backend that keeps sandboxes in process memory.
pub struct MemoryBackend {
    sandboxes: Mutex<HashMap<String, MemorySandbox>>,
    handler: Option<Arc<dyn ExecHandler>>,
    create_delay: Duration,
    create_failure: Mutex<Option<String>>,
    creates: AtomicUsize,
    destroys: AtomicUsize,
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("has_handler", &self.handler.is_some())
            .field("create_delay", &self.create_delay)
            .field("creates", &self.creates.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Backend answering commands with builtins only.
    pub fn new() -> Self {
        Self {
            sandboxes: Mutex::new(HashMap::new()),
            handler: None,
            create_delay: Duration::ZERO,
            create_failure: Mutex::new(None),
            creates: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        }
    }

    /// Install a handler consulted before the builtins.
    pub fn with_handler(mut self, handler: impl ExecHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Make every create wait before completing.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Make subsequent creates fail with `message`, or succeed again with `None`.
    pub fn fail_creates(&self, message: Option<&str>) {
        if let Ok(mut failure) = self.create_failure.lock() {
            *failure = message.map(str::to_string);
        }
    }

    /// Number of successful or failed create calls so far.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of destroy calls that removed a sandbox.
    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Handles of the sandboxes that currently exist.
    pub fn live_handles(&self) -> Vec<String> {
        self.sandboxes
            .lock()
            .map(|sandboxes| sandboxes.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn with_sandbox<T>(
        &self,
        handle: &str,
        f: impl FnOnce(&mut MemorySandbox) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut sandboxes = self
            .sandboxes
            .lock()
            .map_err(|_| BackendError::Unavailable("memory backend lock poisoned".into()))?;
        let sandbox = sandboxes
            .get_mut(handle)
            .ok_or_else(|| BackendError::SessionNotFound(handle.to_string()))?;
        f(sandbox)
    }

    async fn run(&self, handle: &str, request: &ExecRequest, workdir: &str) -> CannedOutput {
        if let Some(handler) = &self.handler
            && let Some(output) = handler.exec(handle, request).await
        {
            return output;
        }
        self.builtin(handle, request, workdir).await
    }

    async fn builtin(&self, handle: &str, request: &ExecRequest, workdir: &str) -> CannedOutput {
        let argv = builtin_argv(request);
        let Some((program, args)) = argv.split_first() else {
            return CannedOutput::failed(127, "empty command\n");
        };

        match program.as_str() {
            "true" => CannedOutput::ok(""),
            "false" => CannedOutput::failed(1, ""),
            "exit" => {
                let code = args.first().and_then(|c| c.parse().ok()).unwrap_or(0);
                CannedOutput::failed(code, "")
            }
            "pwd" => CannedOutput::ok(format!("{workdir}\n")),
            "echo" => CannedOutput::ok(format!("{}\n", args.join(" "))),
            "printenv" => match args.first().and_then(|name| request.env.get(name)) {
                Some(value) => CannedOutput::ok(format!("{value}\n")),
                None => CannedOutput::failed(1, ""),
            },
            "sleep" => {
                let secs: f64 = args.first().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                tokio::time::sleep(Duration::try_from_secs_f64(secs).unwrap_or_default()).await;
                CannedOutput::ok("")
            }
            "cat" => {
                let mut out = CannedOutput::ok("");
                for arg in args {
                    let path = paths::resolve(workdir, arg);
                    let read = self.with_sandbox(handle, |sandbox| match sandbox.nodes.get(&path) {
                        Some(Node::File { data, .. }) => Ok(Some(data.clone())),
                        Some(Node::Dir { .. }) => Ok(None),
                        None => Err(BackendError::FileNotFound(path.clone())),
                    });
                    match read {
                        Ok(Some(data)) => out.stdout.extend_from_slice(&data),
                        Ok(None) => {
                            out.exit_code = 1;
                            out.stderr
                                .extend_from_slice(format!("cat: {arg}: Is a directory\n").as_bytes());
                        }
                        Err(_) => {
                            out.exit_code = 1;
                            out.stderr.extend_from_slice(
                                format!("cat: {arg}: No such file or directory\n").as_bytes(),
                            );
                        }
                    }
                }
                out
            }
            other => CannedOutput::failed(127, format!("sh: 1: {other}: not found\n")),
        }
    }
}

/// Argv for the builtins. Shell lines are split on whitespace; there is no quoting.
fn builtin_argv(request: &ExecRequest) -> Vec<String> {
    let argv = request.command.to_argv();
    match argv.as_slice() {
        [sh, flag, line] if (sh == "sh" || sh == "bash") && flag == "-c" => {
            line.split_whitespace().map(str::to_string).collect()
        }
        _ => argv,
    }
}

#[async_trait]
impl SandboxBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_session(
        &self,
        key: &SessionKey,
        config: &SessionConfig,
    ) -> Result<CodeSession, BackendError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let failure = self
            .create_failure
            .lock()
            .map_err(|_| BackendError::Unavailable("memory backend lock poisoned".into()))?
            .clone();
        if let Some(message) = failure {
            return Err(BackendError::Engine {
                operation: "create sandbox",
                message,
            });
        }

        let now = Utc::now();
        let session = CodeSession {
            id: new_session_id(),
            container_handle: format!("mem-{}", uuid::Uuid::new_v4().simple()),
            key: key.clone(),
            config: config.clone(),
            status: SessionStatus::Ready,
            created_at: now,
            last_used_at: now,
        };
        let mut sandboxes = self
            .sandboxes
            .lock()
            .map_err(|_| BackendError::Unavailable("memory backend lock poisoned".into()))?;
        sandboxes.insert(
            session.container_handle.clone(),
            MemorySandbox::new(session.clone()),
        );
        tracing::debug!(handle = %session.container_handle, session_key = %key, "memory sandbox created");
        Ok(session)
    }

    async fn destroy_session(&self, handle: &str) -> Result<(), BackendError> {
        let mut sandboxes = self
            .sandboxes
            .lock()
            .map_err(|_| BackendError::Unavailable("memory backend lock poisoned".into()))?;
        if sandboxes.remove(handle).is_some() {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get_session(&self, handle: &str) -> Result<CodeSession, BackendError> {
        self.with_sandbox(handle, |sandbox| Ok(sandbox.session.clone()))
    }

    async fn exec(&self, handle: &str, request: &ExecRequest) -> Result<ExecResult, BackendError> {
        let mut request = request.clone();
        let (workdir, env) = self.with_sandbox(handle, |sandbox| {
            let config = &sandbox.session.config;
            Ok((config.resolved_workdir().to_string(), config.env.clone()))
        })?;
        let workdir = match &request.workdir {
            Some(dir) => paths::resolve(&workdir, dir),
            None => workdir,
        };
        for (key, value) in env {
            request.env.entry(key).or_insert(value);
        }

        let started = Instant::now();
        let limit = usize::try_from(request.max_output_bytes).unwrap_or(usize::MAX);
        let (output, timed_out) =
            match tokio::time::timeout(request.timeout, self.run(handle, &request, &workdir)).await {
                Ok(output) => (output, false),
                Err(_) => (
                    CannedOutput {
                        exit_code: -1,
                        ..CannedOutput::default()
                    },
                    true,
                ),
            };

        let mut stdout = LimitedBuffer::new(limit);
        stdout.write(&output.stdout);
        let mut stderr = LimitedBuffer::new(limit);
        stderr.write(&output.stderr);
        let truncated = stdout.was_truncated() || stderr.was_truncated();

        Ok(ExecResult {
            exit_code: output.exit_code,
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
        _mode: u32,
    ) -> Result<(), BackendError> {
        let path = paths::normalize(path);
        self.with_sandbox(handle, |sandbox| {
            sandbox.mkdir_all(paths::parent(&path))?;
            if let Some(Node::Dir { .. }) = sandbox.nodes.get(&path) {
                return Err(BackendError::IsADirectory(path.clone()));
            }
            sandbox.nodes.insert(
                path.clone(),
                Node::File {
                    data: content.to_vec(),
                    modified: Utc::now(),
                },
            );
            Ok(())
        })
    }

    async fn read_file(
        &self,
        handle: &str,
        path: &str,
        max_bytes: Option<u64>,
    ) -> Result<FileContent, BackendError> {
        let path = paths::normalize(path);
        self.with_sandbox(handle, |sandbox| match sandbox.nodes.get(&path) {
            Some(Node::File { data, .. }) => {
                let size_bytes = data.len() as u64;
                let keep = max_bytes.map_or(data.len(), |max| {
                    data.len().min(usize::try_from(max).unwrap_or(usize::MAX))
                });
                Ok(FileContent {
                    data: data[..keep].to_vec(),
                    size_bytes,
                    truncated: keep < data.len(),
                })
            }
            Some(Node::Dir { .. }) => Err(BackendError::NotAFile(path.clone())),
            None => Err(BackendError::FileNotFound(path.clone())),
        })
    }

    async fn list_files(
        &self,
        handle: &str,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<FileEntry>, BackendError> {
        let path = paths::normalize(path);
        let max_depth = if recursive {
            super::listing::RECURSIVE_MAX_DEPTH as usize
        } else {
            1
        };
        self.with_sandbox(handle, |sandbox| {
            if !sandbox.nodes.contains_key(&path) {
                return Err(BackendError::FileNotFound(path.clone()));
            }
            let base_depth = path.split('/').filter(|s| !s.is_empty()).count();
            let entries = sandbox
                .descendants(&path)
                .filter(|(key, _)| {
                    key.split('/').filter(|s| !s.is_empty()).count() - base_depth <= max_depth
                })
                .map(|(key, node)| {
                    let (file_type, size_bytes, modified) = match node {
                        Node::Dir { modified } => (FileType::Directory, 0, *modified),
                        Node::File { data, modified, .. } => {
                            (FileType::File, data.len() as u64, *modified)
                        }
                    };
                    FileEntry {
                        name: paths::file_name(key).to_string(),
                        path: key.clone(),
                        file_type,
                        size_bytes,
                        modified_at: Some(modified),
                    }
                })
                .collect();
            Ok(entries)
        })
    }

    async fn delete_file(
        &self,
        handle: &str,
        path: &str,
        recursive: bool,
    ) -> Result<(), BackendError> {
        let path = paths::normalize(path);
        self.with_sandbox(handle, |sandbox| {
            let is_dir = match sandbox.nodes.get(&path) {
                None => return Err(BackendError::FileNotFound(path.clone())),
                Some(node) => matches!(node, Node::Dir { .. }),
            };
            if is_dir && !recursive {
                return Err(BackendError::IsADirectory(path.clone()));
            }
            if is_dir {
                let doomed: Vec<String> = sandbox
                    .descendants(&path)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in doomed {
                    sandbox.nodes.remove(&key);
                }
            }
            if path != "/" {
                sandbox.nodes.remove(&path);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn backend_with_session() -> (MemoryBackend, CodeSession) {
        let backend = MemoryBackend::new();
        let session = backend
            .create_session(&SessionKey::agent("agent-1"), &SessionConfig::default())
            .await
            .unwrap();
        (backend, session)
    }

    #[tokio::test]
    async fn test_create_and_destroy() {
        let (backend, session) = backend_with_session().await;
        let handle = session.container_handle.clone();

        assert_eq!(session.status, SessionStatus::Ready);
        assert_eq!(backend.get_session(&handle).await.unwrap().id, session.id);

        backend.destroy_session(&handle).await.unwrap();
        assert!(matches!(
            backend.get_session(&handle).await,
            Err(BackendError::SessionNotFound(_))
        ));
        // Destroying twice is fine.
        backend.destroy_session(&handle).await.unwrap();
        assert_eq!(backend.destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_create_failure() {
        let backend = MemoryBackend::new();
        backend.fail_creates(Some("engine down"));
        let err = backend
            .create_session(&SessionKey::agent("a"), &SessionConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("engine down"));
        assert!(backend.live_handles().is_empty());
    }

    #[tokio::test]
    async fn test_write_read_with_parents() {
        let (backend, session) = backend_with_session().await;
        let handle = &session.container_handle;

        backend
            .write_file(handle, "/work/a/b/c.txt", b"nested", 0o644)
            .await
            .unwrap();
        let content = backend.read_file(handle, "/work/a/b/c.txt", None).await.unwrap();
        assert_eq!(content.data, b"nested");
        assert!(!content.truncated);

        assert!(matches!(
            backend.read_file(handle, "/work/a", None).await,
            Err(BackendError::NotAFile(_))
        ));
        assert!(matches!(
            backend.read_file(handle, "/work/missing", None).await,
            Err(BackendError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_truncates_at_ceiling() {
        let (backend, session) = backend_with_session().await;
        let handle = &session.container_handle;
        backend
            .write_file(handle, "/work/big", &[7u8; 100], 0o644)
            .await
            .unwrap();

        let content = backend.read_file(handle, "/work/big", Some(10)).await.unwrap();
        assert_eq!(content.data.len(), 10);
        assert_eq!(content.size_bytes, 100);
        assert!(content.truncated);
    }

    #[tokio::test]
    async fn test_list_depth() {
        let (backend, session) = backend_with_session().await;
        let handle = &session.container_handle;
        backend.write_file(handle, "/work/top.txt", b"1", 0o644).await.unwrap();
        backend.write_file(handle, "/work/dir/inner.txt", b"22", 0o644).await.unwrap();

        let flat = backend.list_files(handle, "/work", false).await.unwrap();
        let names: Vec<_> = flat.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["/work/dir", "/work/top.txt"]);

        let deep = backend.list_files(handle, "/work", true).await.unwrap();
        assert_eq!(deep.len(), 3);
        let inner = deep.iter().find(|e| e.name == "inner.txt").unwrap();
        assert_eq!(inner.size_bytes, 2);
        assert_eq!(inner.file_type, FileType::File);
    }

    #[tokio::test]
    async fn test_list_root_excludes_itself() {
        let (backend, session) = backend_with_session().await;
        let handle = &session.container_handle;

        let entries = backend.list_files(handle, "/", false).await.unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/work"]);
        assert!(entries.iter().all(|e| !e.name.is_empty()));

        backend.delete_file(handle, "/", true).await.unwrap();
        assert!(backend.list_files(handle, "/", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_directory_requires_recursive() {
        let (backend, session) = backend_with_session().await;
        let handle = &session.container_handle;
        backend.write_file(handle, "/work/d/x.txt", b"x", 0o644).await.unwrap();

        assert!(matches!(
            backend.delete_file(handle, "/work/d", false).await,
            Err(BackendError::IsADirectory(_))
        ));
        backend.delete_file(handle, "/work/d", true).await.unwrap();
        assert!(backend.read_file(handle, "/work/d/x.txt", None).await.is_err());
        assert!(matches!(
            backend.delete_file(handle, "/work/d", true).await,
            Err(BackendError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_builtins() {
        let (backend, session) = backend_with_session().await;
        let handle = &session.container_handle;
        backend.write_file(handle, "/work/msg.txt", b"hi there", 0o644).await.unwrap();

        let result = backend
            .exec(handle, &ExecRequest::shell("cat msg.txt"))
            .await
            .unwrap();
        assert_eq!(result.stdout, b"hi there");
        assert!(result.success());

        let result = backend
            .exec(handle, &ExecRequest::argv(["nosuchcmd"]))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 127);

        let result = backend
            .exec(handle, &ExecRequest::argv(["printenv", "GREETING"]).with_env("GREETING", "hello"))
            .await
            .unwrap();
        assert_eq!(result.stdout_lossy(), "hello\n");
    }

    #[tokio::test]
    async fn test_exec_timeout_is_a_result() {
        let (backend, session) = backend_with_session().await;
        let result = backend
            .exec(
                &session.container_handle,
                &ExecRequest::shell("sleep 10").with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_exec_output_truncation() {
        let backend = MemoryBackend::new()
            .with_handler(|_: &ExecRequest| Some(CannedOutput::ok(vec![b'a'; 64])));
        let session = backend
            .create_session(&SessionKey::agent("a"), &SessionConfig::default())
            .await
            .unwrap();
        let result = backend
            .exec(
                &session.container_handle,
                &ExecRequest::argv(["spam"]).with_max_output_bytes(16),
            )
            .await
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.stdout, vec![b'a'; 16]);
    }

    #[tokio::test]
    async fn test_exec_on_missing_sandbox_is_an_error() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.exec("mem-gone", &ExecRequest::argv(["true"])).await,
            Err(BackendError::SessionNotFound(_))
        ));
    }
}
