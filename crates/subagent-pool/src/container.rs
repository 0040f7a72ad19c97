//! Container Runtime Adapter (component C3): the pool's sole capability
//! boundary. Everything pool-side is written against [`ContainerAdapter`],
//! so a fake in-memory adapter suffices for unit tests — no real container
//! engine required (spec §9 "Polymorphism").

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::PoolConfig;
use crate::error::{AdapterError, AdapterOp};

/// Result of [`ContainerAdapter::inspect_container`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectResult {
    pub running: bool,
    pub oom_killed: bool,
}

/// The attached duplex stream returned by [`ContainerAdapter::attach_container`].
/// The worker entity (C4) owns the write half directly and spawns a single
/// reader task over the read half.
pub struct AttachedStream {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
}

/// Abstract interface over the underlying container engine (spec §4.3).
/// `Send + Sync` so a single adapter instance is shared across the pool.
#[async_trait]
pub trait ContainerAdapter: Send + Sync {
    async fn pull_image(&self, cfg: &PoolConfig) -> Result<(), AdapterError>;
    async fn create_container(&self, cfg: &PoolConfig) -> Result<String, AdapterError>;
    async fn start_container(&self, id: &str) -> Result<(), AdapterError>;
    async fn stop_container(&self, id: &str, grace: Option<Duration>) -> Result<(), AdapterError>;
    async fn remove_container(&self, id: &str) -> Result<(), AdapterError>;
    async fn attach_container(&self, id: &str) -> Result<AttachedStream, AdapterError>;
    async fn inspect_container(&self, id: &str) -> Result<InspectResult, AdapterError>;
    async fn close(&self) -> Result<(), AdapterError>;
}

/// Builds the container environment the security invariant governs:
/// exactly `SKILLS_PATH=/workspace/skills`, nothing else. A violation of
/// this invariant is a correctness bug, not a configuration choice — see
/// spec §4.3 and the universal property in spec §8.
pub fn container_env(cfg: &PoolConfig) -> HashMap<String, String> {
    let mut env = HashMap::with_capacity(1);
    env.insert("SKILLS_PATH".to_string(), cfg.skills_mount_path.clone());
    env
}

/// In-memory adapter that spawns a locally running `subagent-worker`
/// process instead of a real container (spec §4.3 "Expansion"). This is
/// what the pool's own tests and a `--no-docker` development mode use.
///
/// "Containers" here are just child process ids keyed by a synthetic
/// incrementing id; there is no image pull, no cgroup, no bind mount — only
/// the protocol-level contract (attach a duplex stdio stream, inspect
/// liveness) is honored.
pub struct FakeAdapter {
    worker_binary: String,
    next_id: AtomicU64,
    children: Mutex<HashMap<String, Child>>,
}

impl FakeAdapter {
    /// `worker_binary` is the path to a `subagent-worker`-compatible
    /// executable; tests typically point this at a trivial echo script.
    pub fn new(worker_binary: impl Into<String>) -> Self {
        Self {
            worker_binary: worker_binary.into(),
            next_id: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ContainerAdapter for FakeAdapter {
    async fn pull_image(&self, _cfg: &PoolConfig) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn create_container(&self, cfg: &PoolConfig) -> Result<String, AdapterError> {
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let env = container_env(cfg);

        let mut command = Command::new(&self.worker_binary);
        command
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| AdapterError::new(AdapterOp::Create, e.to_string()))?;

        self.children.lock().await.insert(id.clone(), child);
        Ok(id)
    }

    async fn start_container(&self, _id: &str) -> Result<(), AdapterError> {
        // The fake's "container" is already running once spawned.
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Option<Duration>) -> Result<(), AdapterError> {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(id) {
            if let Some(grace) = grace {
                let _ = tokio::time::timeout(grace, child.wait()).await;
            }
            let _ = child.start_kill();
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), AdapterError> {
        self.children.lock().await.remove(id);
        Ok(())
    }

    async fn attach_container(&self, id: &str) -> Result<AttachedStream, AdapterError> {
        let mut children = self.children.lock().await;
        let child = children
            .get_mut(id)
            .ok_or_else(|| AdapterError::new(AdapterOp::Attach, format!("no such container {id}")))?;

        let stdin: ChildStdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::new(AdapterOp::Attach, "stdin already taken"))?;
        let stdout: ChildStdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::new(AdapterOp::Attach, "stdout already taken"))?;

        Ok(AttachedStream {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }

    async fn inspect_container(&self, id: &str) -> Result<InspectResult, AdapterError> {
        let mut children = self.children.lock().await;
        let child = children
            .get_mut(id)
            .ok_or_else(|| AdapterError::new(AdapterOp::Inspect, format!("no such container {id}")))?;

        match child.try_wait() {
            Ok(None) => Ok(InspectResult {
                running: true,
                oom_killed: false,
            }),
            Ok(Some(status)) => Ok(InspectResult {
                running: false,
                // A child killed for OOM typically exits via a fatal signal;
                // there is no real cgroup here to inspect, so we treat any
                // signal-terminated exit as OOM-like for test purposes.
                oom_killed: status.code().is_none(),
            }),
            Err(e) => Err(AdapterError::new(AdapterOp::Inspect, e.to_string())),
        }
    }

    async fn close(&self) -> Result<(), AdapterError> {
        let mut children = self.children.lock().await;
        for (_, mut child) in children.drain() {
            let _ = child.start_kill();
        }
        Ok(())
    }
}

/// Arc-wrapped adapter handle shared across the pool and its workers.
pub type SharedAdapter = Arc<dyn ContainerAdapter>;

#[cfg(feature = "docker")]
pub mod docker {
    //! Real container lifecycle against the Docker Engine API (spec §4.3).
    //! Behind the `docker` feature so a plain `cargo build` of the pool
    //! needs no Docker daemon reachable.

    use super::*;
    use bollard::container::{
        Config as BollardConfig, CreateContainerOptions, RemoveContainerOptions,
        StopContainerOptions,
    };
    use bollard::models::{HostConfig, Mount, MountTypeEnum};
    use bollard::Docker;

    pub struct DockerAdapter {
        docker: Docker,
    }

    impl DockerAdapter {
        pub fn connect() -> Result<Self, AdapterError> {
            let docker = Docker::connect_with_local_defaults()
                .map_err(|e| AdapterError::new(AdapterOp::Connect, e.to_string()))?;
            Ok(Self { docker })
        }
    }

    #[async_trait]
    impl ContainerAdapter for DockerAdapter {
        async fn pull_image(&self, cfg: &PoolConfig) -> Result<(), AdapterError> {
            use bollard::image::CreateImageOptions;
            use futures_util::StreamExt;

            if matches!(cfg.pull_policy, crate::config::PullPolicy::Never) {
                return Ok(());
            }

            let mut stream = self.docker.create_image(
                Some(CreateImageOptions {
                    from_image: cfg.image.clone(),
                    ..Default::default()
                }),
                None,
                None,
            );
            while let Some(result) = stream.next().await {
                result.map_err(|e| AdapterError::new(AdapterOp::Pull, e.to_string()))?;
            }
            Ok(())
        }

        async fn create_container(&self, cfg: &PoolConfig) -> Result<String, AdapterError> {
            let memory = cfg
                .memory_limit_bytes()
                .map_err(|e| AdapterError::new(AdapterOp::Create, e))?;
            let nano_cpus = (cfg.cpu_limit * 1e9) as i64;

            let env: Vec<String> = container_env(cfg)
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();

            let host_config = HostConfig {
                memory: Some(memory),
                nano_cpus: Some(nano_cpus),
                pids_limit: Some(cfg.pids_limit as i64),
                readonly_rootfs: Some(cfg.readonly_rootfs),
                security_opt: Some(cfg.security_opts.clone()),
                tmpfs: Some(HashMap::from([("/tmp".to_string(), "rw,size=50m".to_string())])),
                mounts: Some(vec![Mount {
                    target: Some("/workspace/skills".to_string()),
                    source: Some(cfg.skills_mount_path.clone()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            };

            let options = CreateContainerOptions {
                name: format!("subagent-{}", uuid_like()),
                platform: None,
            };

            let response = self
                .docker
                .create_container(
                    Some(options),
                    BollardConfig {
                        image: Some(cfg.image.clone()),
                        env: Some(env),
                        host_config: Some(host_config),
                        open_stdin: Some(true),
                        attach_stdin: Some(true),
                        attach_stdout: Some(true),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| AdapterError::new(AdapterOp::Create, e.to_string()))?;

            Ok(response.id)
        }

        async fn start_container(&self, id: &str) -> Result<(), AdapterError> {
            self.docker
                .start_container::<String>(id, None)
                .await
                .map_err(|e| AdapterError::new(AdapterOp::Start, e.to_string()))
        }

        async fn stop_container(&self, id: &str, grace: Option<Duration>) -> Result<(), AdapterError> {
            self.docker
                .stop_container(
                    id,
                    Some(StopContainerOptions {
                        t: grace.map(|d| d.as_secs() as i64).unwrap_or(5),
                    }),
                )
                .await
                .map_err(|e| AdapterError::new(AdapterOp::Stop, e.to_string()))
        }

        async fn remove_container(&self, id: &str) -> Result<(), AdapterError> {
            self.docker
                .remove_container(
                    id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| AdapterError::new(AdapterOp::Remove, e.to_string()))
        }

        async fn attach_container(&self, id: &str) -> Result<AttachedStream, AdapterError> {
            use bollard::container::AttachContainerOptions;
            use futures_util::StreamExt;

            let attach = self
                .docker
                .attach_container(
                    id,
                    Some(AttachContainerOptions::<String> {
                        stdin: Some(true),
                        stdout: Some(true),
                        stderr: Some(false),
                        stream: Some(true),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| AdapterError::new(AdapterOp::Attach, e.to_string()))?;

            let stdout = tokio_util_compat_reader(attach.output.map(|r| {
                r.map(|chunk| chunk.into_bytes().to_vec())
                    .map_err(std::io::Error::other)
            }));

            Ok(AttachedStream {
                stdin: Box::new(attach.input),
                stdout: Box::new(stdout),
            })
        }

        async fn inspect_container(&self, id: &str) -> Result<InspectResult, AdapterError> {
            let details = self
                .docker
                .inspect_container(id, None)
                .await
                .map_err(|e| AdapterError::new(AdapterOp::Inspect, e.to_string()))?;

            let state = details.state.unwrap_or_default();
            Ok(InspectResult {
                running: state.running.unwrap_or(false),
                oom_killed: state.oom_killed.unwrap_or(false),
            })
        }

        async fn close(&self) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    fn uuid_like() -> String {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..12).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
    }

    /// Adapts a byte-chunk stream into an `AsyncRead`, since bollard's
    /// attach output is a `Stream<Item = Result<Bytes>>`, not an `AsyncRead`.
    fn tokio_util_compat_reader<S>(stream: S) -> impl AsyncRead + Send + Unpin
    where
        S: futures_util::Stream<Item = std::io::Result<Vec<u8>>> + Send + Unpin + 'static,
    {
        tokio_util::io::StreamReader::new(stream)
    }
}
