//! Container runtime backed by the `docker` CLI.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::security::ResolvedSecurity;

use super::{ContainerConfig, ContainerInfo, ContainerRuntime, ContainerState, ImageBuildSpec};

/// Host path of the docker socket.
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Output of a finished docker invocation.
struct DockerOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Runtime that shells out to the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    /// Path to the docker binary.
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    /// Uses `docker` from `PATH`.
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Uses a specific docker-compatible binary (e.g. `podman`).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, ctx: &OpContext, args: &[String]) -> Result<DockerOutput> {
        tracing::debug!(cmd = %self.binary, ?args, "running docker");

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Runtime(format!("failed to spawn {}: {}", self.binary, e)))?;

        let output = ctx
            .run(async move { child.wait_with_output().await.map_err(Error::from) })
            .await?;

        Ok(DockerOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Runs docker and maps a non-zero exit through `on_err`.
    async fn run(
        &self,
        ctx: &OpContext,
        args: &[String],
        on_err: impl FnOnce(String) -> Error,
    ) -> Result<String> {
        let out = self.exec(ctx, args).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(on_err(out.stderr))
        }
    }

    fn create_args(config: &ContainerConfig) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            config.name.clone(),
            "--workdir".to_string(),
            config.working_dir.display().to_string(),
        ];

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for mount in &config.mounts {
            let mut spec = format!(
                "type=bind,source={},target={}",
                mount.source.display(),
                mount.target.display()
            );
            if mount.read_only {
                spec.push_str(",readonly");
            }
            args.push("--mount".to_string());
            args.push(spec);
        }

        for (key, value) in &config.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        let limits = config.limits.or_defaults();
        args.push("--cpus".to_string());
        args.push(format!("{}", limits.cpus));
        args.push("--memory".to_string());
        args.push(limits.memory_bytes.to_string());

        args.extend(security_args(&config.security));

        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());
        args
    }
}

/// Translates resolved security settings into `docker create` flags.
pub fn security_args(sec: &ResolvedSecurity) -> Vec<String> {
    let mut args = Vec::new();

    if sec.privileged {
        args.push("--privileged".to_string());
    }
    if sec.no_new_privileges {
        args.push("--security-opt".to_string());
        args.push("no-new-privileges".to_string());
    }
    if sec.init {
        args.push("--init".to_string());
    }
    if sec.pids_limit > 0 {
        args.push("--pids-limit".to_string());
        args.push(sec.pids_limit.to_string());
    }
    for cap in &sec.cap_drop {
        args.push("--cap-drop".to_string());
        args.push(cap.clone());
    }
    for cap in &sec.cap_add {
        args.push("--cap-add".to_string());
        args.push(cap.clone());
    }
    if sec.host_network {
        args.push("--network".to_string());
        args.push("host".to_string());
    }
    if sec.host_pid {
        args.push("--pid".to_string());
        args.push("host".to_string());
    }
    if sec.host_ipc {
        args.push("--ipc".to_string());
        args.push("host".to_string());
    }
    if sec.docker_socket {
        args.push("--mount".to_string());
        args.push(format!(
            "type=bind,source={0},target={0}",
            DOCKER_SOCKET
        ));
    }

    args
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

fn parse_ps_output(stdout: &str, name_prefix: &str) -> Result<Vec<ContainerInfo>> {
    let mut containers = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let ps: PsLine = serde_json::from_str(line)
            .map_err(|e| Error::Runtime(format!("unexpected docker ps output: {}", e)))?;

        // `--filter name=` is a substring match
        let name = ps.names.split(',').next().unwrap_or_default().to_string();
        if !name.starts_with(name_prefix) {
            continue;
        }

        containers.push(ContainerInfo {
            id: ps.id,
            name,
            image: ps.image,
            state: ContainerState::from_status(&ps.state),
            labels: parse_labels(&ps.labels),
        });
    }
    Ok(containers)
}

/// Error mapping for calls that target container `id`.
fn container_error(id: &str) -> impl FnOnce(String) -> Error + '_ {
    move |stderr| {
        let lower = stderr.to_lowercase();
        // `inspect` says "object" rather than "container" on older daemons
        if lower.contains("no such container") || lower.contains("no such object") {
            Error::ContainerNotFound(id.to_string())
        } else {
            Error::Runtime(stderr)
        }
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create_container(&self, ctx: &OpContext, config: &ContainerConfig) -> Result<String> {
        let id = self
            .run(ctx, &Self::create_args(config), Error::ContainerCreate)
            .await?;
        tracing::info!(name = %config.name, container_id = %id, tier = %config.security.tier, "created container");
        Ok(id)
    }

    async fn start_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.run(ctx, &args(["start", id]), |reason| Error::ContainerStart {
            id: id.to_string(),
            reason,
        })
        .await
        .map(|_| ())
    }

    async fn stop_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.run(ctx, &args(["stop", id]), container_error(id))
            .await
            .map(|_| ())
    }

    async fn pause_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.run(ctx, &args(["pause", id]), container_error(id))
            .await
            .map(|_| ())
    }

    async fn unpause_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.run(ctx, &args(["unpause", id]), container_error(id))
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.run(ctx, &args(["rm", "--force", id]), container_error(id))
            .await
            .map(|_| ())
    }

    async fn get_container_state(&self, ctx: &OpContext, id: &str) -> Result<ContainerState> {
        let status = self
            .run(
                ctx,
                &args(["inspect", "--format", "{{.State.Status}}", id]),
                container_error(id),
            )
            .await?;
        Ok(ContainerState::from_status(&status))
    }

    async fn list_containers(&self, ctx: &OpContext, name_prefix: &str) -> Result<Vec<ContainerInfo>> {
        let filter = format!("name={}", name_prefix);
        let stdout = self
            .run(
                ctx,
                &args(["ps", "--all", "--no-trunc", "--filter", filter.as_str(), "--format", "{{json .}}"]),
                Error::Runtime,
            )
            .await?;
        parse_ps_output(&stdout, name_prefix)
    }

    async fn image_exists(&self, ctx: &OpContext, image: &str) -> Result<bool> {
        let out = self.exec(ctx, &args(["image", "inspect", image])).await?;
        if out.success {
            return Ok(true);
        }
        if out.stderr.to_lowercase().contains("no such image") {
            return Ok(false);
        }
        Err(Error::Runtime(out.stderr))
    }

    async fn build_image(&self, ctx: &OpContext, spec: &ImageBuildSpec) -> Result<()> {
        let mut build = args(["build", "--tag", spec.image.as_str()]);
        if let Some(dockerfile) = &spec.dockerfile {
            build.push("--file".to_string());
            build.push(dockerfile.display().to_string());
        }
        for (key, value) in &spec.build_args {
            build.push("--build-arg".to_string());
            build.push(format!("{}={}", key, value));
        }
        build.push(spec.context_dir.display().to_string());

        tracing::info!(image = %spec.image, context = ?spec.context_dir, "building image");
        self.run(ctx, &build, |reason| Error::ImageBuild {
            image: spec.image.clone(),
            reason,
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Mount, ResourceLimits};
    use crate::security::{SecurityConfig, SecurityTier};

    fn sample_config() -> ContainerConfig {
        ContainerConfig {
            name: "workstream-repo-main-20260314-092653".to_string(),
            image: "dev:latest".to_string(),
            mounts: vec![
                Mount::same_path("/repo-worktrees/main"),
                Mount::read_only("/home/u/.gitconfig", "/root/.gitconfig"),
            ],
            working_dir: "/repo-worktrees/main".into(),
            env: vec![("TERM".to_string(), "xterm".to_string())],
            labels: BTreeMap::from([("dev.workstream.branch".to_string(), "main".to_string())]),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            limits: ResourceLimits::default(),
            security: SecurityConfig::default().resolve(SecurityTier::Hardened),
        }
    }

    #[test]
    fn hardened_args_drop_capabilities() {
        let sec = SecurityConfig::default().resolve(SecurityTier::Hardened);
        let args = security_args(&sec);

        assert_eq!(args.iter().filter(|a| *a == "--cap-drop").count(), 5);
        assert!(args.contains(&"no-new-privileges".to_string()));
        assert!(args.contains(&"--init".to_string()));
        assert!(args.contains(&"1024".to_string()));
        assert!(!args.contains(&"--privileged".to_string()));
    }

    #[test]
    fn compat_args_drop_nothing() {
        let sec = SecurityConfig::default().resolve(SecurityTier::Compat);
        let args = security_args(&sec);
        assert!(!args.contains(&"--cap-drop".to_string()));
        assert!(!args.contains(&"no-new-privileges".to_string()));
    }

    #[test]
    fn host_namespaces_and_socket_map_to_flags() {
        let sec = SecurityConfig {
            host_network: true,
            host_pid: true,
            host_ipc: true,
            docker_socket: true,
            ..Default::default()
        }
        .resolve(SecurityTier::Moderate);
        let joined = security_args(&sec).join(" ");

        assert!(joined.contains("--network host"));
        assert!(joined.contains("--pid host"));
        assert!(joined.contains("--ipc host"));
        assert!(joined.contains("/var/run/docker.sock"));
    }

    #[test]
    fn create_args_carry_mounts_limits_and_image_last() {
        let args = DockerCli::create_args(&sample_config());
        let joined = args.join(" ");

        assert!(joined.contains(
            "--mount type=bind,source=/repo-worktrees/main,target=/repo-worktrees/main"
        ));
        assert!(joined.contains("target=/root/.gitconfig,readonly"));
        assert!(joined.contains("--cpus 2"));
        assert!(joined.contains(&format!("--memory {}", 4u64 * 1024 * 1024 * 1024)));
        assert!(joined.contains("--label dev.workstream.branch=main"));

        let image_pos = args.iter().position(|a| a == "dev:latest").unwrap();
        assert_eq!(&args[image_pos + 1..], ["sleep", "infinity"]);
    }

    #[test]
    fn ps_output_filters_by_prefix() {
        let stdout = concat!(
            r#"{"ID":"aaa","Names":"workstream-repo-main-20260314-092653","Image":"dev","State":"running","Labels":"dev.workstream.branch=main,dev.workstream.project=repo"}"#,
            "\n",
            r#"{"ID":"bbb","Names":"other-workstream-repo-x","Image":"dev","State":"exited","Labels":""}"#,
            "\n"
        );

        let list = parse_ps_output(stdout, "workstream-repo-").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "aaa");
        assert_eq!(list[0].state, ContainerState::Running);
        assert_eq!(list[0].labels.get("dev.workstream.project").unwrap(), "repo");
    }

    #[test]
    fn malformed_ps_output_is_runtime_error() {
        let err = parse_ps_output("not json", "x").unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }

    #[test]
    fn missing_container_stderr_maps_to_not_found() {
        let err = container_error("abc")("Error response from daemon: No such container: abc".into());
        assert!(matches!(err, Error::ContainerNotFound(id) if id == "abc"));

        let err = container_error("abc")("Error: No such object: abc".into());
        assert!(matches!(err, Error::ContainerNotFound(_)));

        let err = container_error("abc")("permission denied".into());
        assert!(matches!(err, Error::Runtime(msg) if msg == "permission denied"));
    }

    #[tokio::test]
    async fn configured_binary_is_the_one_spawned() {
        let cli = DockerCli::with_binary("workstream-no-such-runtime");
        let err = cli
            .list_containers(&OpContext::new(), "workstream-")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(msg) if msg.contains("workstream-no-such-runtime")));
    }
}
