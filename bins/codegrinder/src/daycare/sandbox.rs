/// Container Sandbox
///
/// **Core Responsibility:**
/// Obtain one disposable container from the Docker engine, keep student code
/// inside the configured resource ceilings, and guarantee the container is
/// reaped on every exit path.
///
/// **Docker Execution Rules:**
/// 1. Pulls the problem-type image if not present
/// 2. Creates the container with security constraints:
///    - Network disabled
///    - Memory + swap capped, pids capped
///    - cpu/nofile/fsize ulimits from the action config
///    - Read-only root filesystem with a tmpfs scratch mount
///    - Student code execs run as the unprivileged `student` user
/// 3. Student files are streamed in as a tar archive
/// 4. Each exec step attaches stdin/stdout/stderr
/// 5. Destroy is idempotent, with a Drop guard as a backstop
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use codegrinder_common::types::valid_file_path;
use codegrinder_common::ActionConfig;
use futures_util::stream::StreamExt;
use futures_util::Stream;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

/// Writable scratch directory where student files land and execs run.
pub const SCRATCH_DIR: &str = "/home/student";

/// Unprivileged user that owns every exec inside the container.
pub const SANDBOX_USER: &str = "student";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("image {image} is unavailable: {message}")]
    ImageUnavailable { image: String, message: String },
    #[error("container engine is unavailable: {0}")]
    SandboxUnavailable(#[from] bollard::errors::Error),
    #[error("invalid file path {0:?}")]
    InvalidPath(String),
    #[error("failed to build file archive: {0}")]
    Archive(#[from] std::io::Error),
}

/// A running exec step: its id (for exit-code inspection), the demuxed
/// stdout/stderr stream, and the stdin handle.
pub struct ExecHandle {
    pub id: String,
    pub output: Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Map an action's resource ceilings onto Docker host configuration.
///
/// The cpu ulimit caps cumulative user+system seconds; fsize caps any single
/// file the student writes; memory_swap == memory means no swap headroom.
pub fn limits_to_host_config(action: &ActionConfig) -> HostConfig {
    let memory = (action.max_memory * 1024 * 1024) as i64;
    let file_size = (action.max_file_size * 1024 * 1024) as i64;
    HostConfig {
        memory: Some(memory),
        memory_swap: Some(memory),
        pids_limit: Some(action.max_threads as i64),
        ulimits: Some(vec![
            ResourcesUlimits {
                name: Some("cpu".to_string()),
                soft: Some(action.max_cpu as i64),
                hard: Some(action.max_cpu as i64),
            },
            ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(action.max_fd as i64),
                hard: Some(action.max_fd as i64),
            },
            ResourcesUlimits {
                name: Some("fsize".to_string()),
                soft: Some(file_size),
                hard: Some(file_size),
            },
        ]),
        readonly_rootfs: Some(true),
        // scratch sized for a handful of files at the write cap
        tmpfs: Some(HashMap::from([(
            SCRATCH_DIR.to_string(),
            format!("rw,exec,size={}m", action.max_file_size * 4),
        )])),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges:true".to_string()]),
        ..Default::default()
    }
}

/// Build an in-memory tar archive of the commit's file map. Paths are
/// validated again here so nothing can escape the scratch mount even if an
/// unvalidated commit slips through.
pub fn files_tarball(files: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, SandboxError> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        if !valid_file_path(name) {
            return Err(SandboxError::InvalidPath(name.clone()));
        }
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

/// One disposable container bound to one session.
pub struct Sandbox {
    docker: Docker,
    container_id: String,
    destroyed: Arc<AtomicBool>,
}

impl Sandbox {
    /// Ensure the image is present, then create and start the container.
    pub async fn create(
        docker: &Docker,
        image: &str,
        action: &ActionConfig,
    ) -> Result<Self, SandboxError> {
        ensure_image(docker, image).await?;

        let name = format!("daycare-{}", uuid::Uuid::new_v4());
        let config = Config {
            image: Some(image.to_string()),
            // keep-alive process; student code runs via exec as SANDBOX_USER
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "sleep infinity".to_string(),
            ]),
            working_dir: Some(SCRATCH_DIR.to_string()),
            network_disabled: Some(true),
            host_config: Some(limits_to_host_config(action)),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container = docker.create_container(Some(create_options), config).await?;
        let container_id = container.id;

        let sandbox = Sandbox {
            docker: docker.clone(),
            container_id: container_id.clone(),
            destroyed: Arc::new(AtomicBool::new(false)),
        };

        // From here on the Drop guard covers failure paths.
        sandbox
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await?;
        debug!(container_id = %container_id, image = %image, "container started");

        Ok(sandbox)
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Write the commit's files under the scratch mount, creating
    /// intermediate directories as the archive unpacks.
    pub async fn put_files(&self, files: &BTreeMap<String, Vec<u8>>) -> Result<(), SandboxError> {
        if files.is_empty() {
            return Ok(());
        }
        let tarball = files_tarball(files)?;
        let options = UploadToContainerOptions {
            path: SCRATCH_DIR,
            ..Default::default()
        };
        self.docker
            .upload_to_container(&self.container_id, Some(options), tarball.into())
            .await?;
        Ok(())
    }

    /// Start one exec step as the sandbox user. The returned handle carries
    /// the demuxed output stream; exit status comes from `exit_code` after
    /// the stream ends.
    pub async fn exec(&self, argv: &[String], interactive: bool) -> Result<ExecHandle, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdin: Some(interactive),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some(SANDBOX_USER.to_string()),
                    working_dir: Some(SCRATCH_DIR.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        match self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?
        {
            StartExecResults::Attached { output, input } => Ok(ExecHandle {
                id: exec.id,
                output,
                input,
            }),
            StartExecResults::Detached => Err(SandboxError::ImageUnavailable {
                image: String::new(),
                message: "exec unexpectedly detached".to_string(),
            }),
        }
    }

    /// Exit code of a finished exec, if Docker reported one.
    pub async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, SandboxError> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(inspect.exit_code)
    }

    /// Best-effort kill of every student process, used when a step blows its
    /// deadline. The keep-alive process is not owned by the sandbox user and
    /// survives, so later steps can still run.
    pub async fn kill_student_processes(&self) {
        let result = async {
            let exec = self
                .docker
                .create_exec(
                    &self.container_id,
                    CreateExecOptions {
                        cmd: Some(vec![
                            "pkill".to_string(),
                            "-KILL".to_string(),
                            "-u".to_string(),
                            SANDBOX_USER.to_string(),
                        ]),
                        ..Default::default()
                    },
                )
                .await?;
            self.docker
                .start_exec(
                    &exec.id,
                    Some(StartExecOptions {
                        detach: true,
                        ..Default::default()
                    }),
                )
                .await
        }
        .await;
        if let Err(err) = result {
            warn!(container_id = %self.container_id, error = %err, "failed to kill student processes");
        }
    }

    /// Forcibly remove the container. Idempotent; safe to call from any exit
    /// path, and the Drop guard repeats it if nothing else did.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(&self.container_id, Some(options))
            .await
        {
            Ok(()) => debug!(container_id = %self.container_id, "container destroyed"),
            Err(err) => {
                warn!(container_id = %self.container_id, error = %err, "failed to remove container")
            }
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        // Backstop only: destroy() normally ran already and flipped the flag.
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(err) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %err, "drop-guard container removal failed");
            }
        });
    }
}

/// Verify the image exists locally, pulling it when missing.
async fn ensure_image(docker: &Docker, image: &str) -> Result<(), SandboxError> {
    if docker.inspect_image(image).await.is_ok() {
        debug!(image = %image, "image cache hit");
        return Ok(());
    }

    warn!(image = %image, "image cache miss, pulling");
    let options = Some(CreateImageOptions {
        from_image: image,
        ..Default::default()
    });
    let mut stream = docker.create_image(options, None, None);
    while let Some(progress) = stream.next().await {
        if let Err(err) = progress {
            return Err(SandboxError::ImageUnavailable {
                image: image.to_string(),
                message: err.to_string(),
            });
        }
    }
    info!(image = %image, "image pulled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_action() -> ActionConfig {
        serde_json::from_str(
            r#"{
                "maxCPU": 10,
                "maxMemory": 256,
                "maxFD": 100,
                "maxFileSize": 10,
                "maxThreads": 100,
                "commands": [["make", "grade"]]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_limits_map_onto_host_config() {
        let host = limits_to_host_config(&make_action());
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.memory_swap, Some(256 * 1024 * 1024));
        assert_eq!(host.pids_limit, Some(100));
        assert_eq!(host.readonly_rootfs, Some(true));

        let ulimits = host.ulimits.unwrap();
        let find = |name: &str| {
            ulimits
                .iter()
                .find(|u| u.name.as_deref() == Some(name))
                .unwrap()
                .clone()
        };
        assert_eq!(find("cpu").hard, Some(10));
        assert_eq!(find("nofile").hard, Some(100));
        assert_eq!(find("fsize").hard, Some(10 * 1024 * 1024));

        let tmpfs = host.tmpfs.unwrap();
        assert!(tmpfs.contains_key(SCRATCH_DIR));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
    }

    #[test]
    fn test_tarball_contains_every_file() {
        let files = BTreeMap::from([
            ("main.py".to_string(), b"print('hi')\n".to_vec()),
            ("inputs/case1.in".to_string(), b"5\n".to_vec()),
        ]);
        let tarball = files_tarball(&files).unwrap();

        let mut archive = tar::Archive::new(tarball.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["inputs/case1.in", "main.py"]);
    }

    #[test]
    fn test_tarball_rejects_escaping_paths() {
        let files = BTreeMap::from([("../escape.py".to_string(), b"x".to_vec())]);
        assert!(matches!(
            files_tarball(&files),
            Err(SandboxError::InvalidPath(_))
        ));

        let files = BTreeMap::from([("/etc/passwd".to_string(), b"x".to_vec())]);
        assert!(matches!(
            files_tarball(&files),
            Err(SandboxError::InvalidPath(_))
        ));
    }
}
