//! Node agent driving a beacon node binary
//!
//! Every operation shells out to the node binary with `tokio::process`. The
//! long-running `start` command is kept as a child process whose output is
//! appended to `<node folder>/node.log`.

use beacon_demo_core::node::{
    async_trait, DkgParams, NodeAgent, NodeFactory, NodeHandle, ReshareParams, Role, StartOptions,
};
use beacon_demo_core::{BeaconValue, DemoConfig, Error, Group, NodeIdentity, NodeIndex, Result};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Name of the log file inside a node folder
pub const LOG_FILE: &str = "node.log";

/// Captured output of a finished node command
#[derive(Debug, Clone)]
struct CommandOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

/// Distinct free local ports; every listener is held until all are bound
fn free_ports<const N: usize>() -> Result<[u16; N]> {
    let mut listeners = Vec::with_capacity(N);
    let mut ports = [0u16; N];
    for port in ports.iter_mut() {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        *port = listener.local_addr()?.port();
        listeners.push(listener);
    }
    Ok(ports)
}

fn secs(d: Duration) -> String {
    format!("{}s", d.as_secs())
}

fn read_binary(binary: &RwLock<PathBuf>) -> Result<PathBuf> {
    binary
        .read()
        .map(|b| b.clone())
        .map_err(|_| Error::Internal("binary lock poisoned".into()))
}

fn write_binary(binary: &RwLock<PathBuf>, path: &Path) -> bool {
    match binary.write() {
        Ok(mut current) => {
            *current = path.to_path_buf();
            true
        }
        Err(_) => false,
    }
}

/// Creates [`ProcessNode`]s on free local ports
pub struct ProcessNodeFactory {
    config: Arc<DemoConfig>,
    binary: RwLock<PathBuf>,
}

impl ProcessNodeFactory {
    /// Create a factory running `binary`
    pub fn new(config: Arc<DemoConfig>, binary: PathBuf) -> Self {
        Self {
            config,
            binary: RwLock::new(binary),
        }
    }
}

#[async_trait]
impl NodeFactory for ProcessNodeFactory {
    async fn create(&self, index: NodeIndex) -> Result<NodeHandle> {
        let [private, public, control] = free_ports::<3>()?;
        let identity = NodeIdentity::new(
            index,
            &format!("127.0.0.1:{private}"),
            &format!("127.0.0.1:{public}"),
            &control.to_string(),
        );
        let node = ProcessNode::new(identity, self.config.clone(), read_binary(&self.binary)?);
        node.generate_keypair().await?;
        Ok(Arc::new(node))
    }

    fn update_binary(&self, binary: &Path) -> bool {
        write_binary(&self.binary, binary)
    }
}

/// Node agent backed by a node binary
pub struct ProcessNode {
    identity: NodeIdentity,
    config: Arc<DemoConfig>,
    folder: PathBuf,
    binary: RwLock<PathBuf>,
    child: Mutex<Option<Child>>,
}

impl ProcessNode {
    /// Create an agent; nothing runs until a command is issued
    pub fn new(identity: NodeIdentity, config: Arc<DemoConfig>, binary: PathBuf) -> Self {
        let folder = config.node_folder(identity.index);
        Self {
            identity,
            config,
            folder,
            binary: RwLock::new(binary),
            child: Mutex::new(None),
        }
    }

    /// Working folder of the node
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn folder_arg(&self) -> String {
        self.folder.display().to_string()
    }

    fn control_args(&self) -> Vec<String> {
        vec![
            "--control".into(),
            self.identity.ctrl_addr.clone(),
            "--id".into(),
            self.config.canonical_beacon_id().to_string(),
        ]
    }

    fn tls_args(&self) -> Vec<String> {
        if self.config.tls {
            Vec::new()
        } else {
            vec!["--tls-disable".into()]
        }
    }

    fn render(&self, binary: &Path, args: &[String]) -> String {
        format!("{} {}", binary.display(), args.join(" "))
    }

    async fn run(&self, args: Vec<String>) -> Result<CommandOutput> {
        let binary = read_binary(&self.binary)?;
        debug!(index = self.identity.index, command = %self.render(&binary, &args), "Running node command");
        let output = Command::new(&binary).args(&args).output().await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        })
    }

    async fn run_ok(&self, args: Vec<String>) -> Result<CommandOutput> {
        let subcommand = args.first().cloned().unwrap_or_default();
        let output = self.run(args).await?;
        if !output.success {
            return Err(Error::Node(format!(
                "node {} `{subcommand}` failed: {}",
                self.identity.index,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn generate_keypair(&self) -> Result<()> {
        let mut args = vec![
            "generate-keypair".to_string(),
            "--folder".into(),
            self.folder_arg(),
            "--id".into(),
            self.config.canonical_beacon_id().to_string(),
            "--scheme".into(),
            self.config.scheme.clone(),
        ];
        args.extend(self.tls_args());
        args.push(self.identity.private_addr.clone());
        self.run_ok(args).await?;
        Ok(())
    }

    fn role_args(&self, role: &Role) -> Vec<String> {
        match role {
            Role::Leader => vec!["--leader".into()],
            Role::Follower { leader } => vec!["--connect".into(), leader.clone()],
        }
    }

    /// Run a `share` command; a follower refused by its leader reports the
    /// leader as unreachable
    async fn share(&self, mut args: Vec<String>, role: &Role) -> Result<CommandOutput> {
        args.extend(self.role_args(role));
        args.extend(self.tls_args());
        args.extend(self.control_args());
        let output = self.run(args).await?;
        if output.success {
            return Ok(output);
        }
        match role {
            Role::Follower { leader } if output.stderr.contains("connection refused") => {
                Err(Error::LeaderUnreachable(leader.clone()))
            }
            _ => Err(Error::Node(format!(
                "node {} share failed: {}",
                self.identity.index,
                output.stderr.trim()
            ))),
        }
    }

    async fn copy_artifact(&self, from: PathBuf, to: &Path) -> Result<()> {
        tokio::fs::copy(&from, to)
            .await
            .map(|_| ())
            .map_err(|e| Error::Artifact {
                path: to.to_path_buf(),
                reason: format!("copy from {}: {e}", from.display()),
            })
    }
}

#[async_trait]
impl NodeAgent for ProcessNode {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    async fn write_certificate(&self, path: &Path) -> Result<()> {
        if !self.config.tls {
            debug!(index = self.identity.index, "TLS disabled, no certificate to write");
            return Ok(());
        }
        self.copy_artifact(self.folder.join("tls").join("server.crt"), path)
            .await
    }

    async fn write_public(&self, path: &Path) -> Result<()> {
        self.copy_artifact(self.folder.join("key").join("public.json"), path)
            .await
    }

    async fn start(&self, options: &StartOptions) -> Result<()> {
        let mut args = vec![
            "start".to_string(),
            "--folder".into(),
            self.folder_arg(),
            "--private-listen".into(),
            self.identity.private_addr.clone(),
            "--public-listen".into(),
            self.identity.public_addr.clone(),
            "--certs-dir".into(),
            options.cert_dir.display().to_string(),
        ];
        args.extend(self.control_args());
        args.extend(self.tls_args());
        if let Some(storage) = &options.storage {
            args.extend(["--db".to_string(), storage.engine.as_str().to_string()]);
            if let Some(dsn) = storage.dsn_for(self.identity.index) {
                args.extend(["--pg-dsn".to_string(), dsn]);
            }
            args.extend(["--memdb-size".to_string(), storage.memdb_size.to_string()]);
        }

        std::fs::create_dir_all(&self.folder)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.folder.join(LOG_FILE))?;
        let binary = read_binary(&self.binary)?;
        info!(index = self.identity.index, command = %self.render(&binary, &args), "Starting node process");

        let child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| Error::NodeStart {
                index: self.identity.index,
                reason: e.to_string(),
            })?;
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut args = vec!["stop".to_string()];
        args.extend(self.control_args());
        let result = self.run_ok(args).await;

        let mut child = self.child.lock().await;
        if result.is_err() {
            if let Some(process) = child.as_mut() {
                warn!(index = self.identity.index, "Stop command failed, killing process");
                let _ = process.start_kill();
            }
        }
        child.take();
        result.map(|_| ())
    }

    async fn ping(&self) -> bool {
        let mut args = vec!["util".to_string(), "ping".into()];
        args.extend(self.control_args());
        matches!(self.run(args).await, Ok(output) if output.success)
    }

    async fn run_dkg(&self, params: &DkgParams, role: &Role) -> Result<()> {
        let mut args = vec!["share".to_string()];
        if role.is_leader() {
            args.extend([
                "--nodes".to_string(),
                params.nodes.to_string(),
                "--threshold".into(),
                params.threshold.to_string(),
                "--period".into(),
                secs(params.period),
                "--scheme".into(),
                self.config.scheme.clone(),
                "--beacon-delay".into(),
                params.beacon_offset.to_string(),
            ]);
        }
        args.extend(["--timeout".to_string(), secs(params.timeout)]);
        self.share(args, role).await?;
        Ok(())
    }

    async fn run_reshare(&self, params: &ReshareParams, role: &Role) -> Result<Group> {
        let mut args = vec!["share".to_string(), "--transition".into()];
        if role.is_leader() {
            args.extend([
                "--nodes".to_string(),
                params.nodes.to_string(),
                "--threshold".into(),
                params.threshold.to_string(),
                "--beacon-delay".into(),
                params.beacon_offset.to_string(),
            ]);
        }
        if let Some(old) = &params.old_group {
            args.extend(["--from".to_string(), old.display().to_string()]);
        }
        args.extend(["--timeout".to_string(), secs(params.timeout)]);
        self.share(args, role).await?;
        self.get_group().await
    }

    async fn chain_info(&self) -> bool {
        let mut args = vec!["show".to_string(), "chain-info".into()];
        args.extend(self.control_args());
        matches!(self.run(args).await, Ok(output) if output.success)
    }

    async fn get_group(&self) -> Result<Group> {
        let mut args = vec!["show".to_string(), "group".into(), "--json".into()];
        args.extend(self.control_args());
        let output = self.run_ok(args).await?;
        Ok(serde_json::from_str(&output.stdout)?)
    }

    async fn get_beacon(&self, group_path: &Path, round: u64) -> Result<(BeaconValue, String)> {
        let mut args = vec![
            "get".to_string(),
            "public".into(),
            "--round".into(),
            round.to_string(),
        ];
        if self.config.tls {
            args.extend([
                "--tls-cert".to_string(),
                self.config.cert_path(self.identity.index).display().to_string(),
            ]);
        }
        args.push(group_path.display().to_string());

        let command = self.render(&read_binary(&self.binary)?, &args);
        let output = self.run_ok(args).await?;
        let value: BeaconValue = serde_json::from_str(&output.stdout)?;
        Ok((value, command))
    }

    async fn log_output(&self) -> Result<String> {
        let path = self.folder.join(LOG_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(log) => Ok(log),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn update_binary(&self, binary: &Path) -> bool {
        write_binary(&self.binary, binary)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Stand-in node binary answering a handful of commands
    const FAKE_NODE: &str = r#"#!/bin/sh
case "$1" in
  generate-keypair)
    mkdir -p "$3/key"
    echo '{"address":"x"}' > "$3/key/public.json"
    ;;
  util)
    exit 0
    ;;
  share)
    for arg in "$@"; do
      if [ "$arg" = "--connect" ]; then
        echo "dial tcp: connection refused" >&2
        exit 1
      fi
    done
    ;;
  get)
    echo '{"round":'"$4"',"signature":"abcd"}'
    ;;
  *)
    echo "unknown command $1" >&2
    exit 2
    ;;
esac
"#;

    fn fake_binary(dir: &Path) -> PathBuf {
        let path = dir.join("fake-node");
        std::fs::write(&path, FAKE_NODE).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(dir: &Path) -> Arc<DemoConfig> {
        Arc::new(DemoConfig::new(3, 2, Duration::from_secs(2), dir.join("demo")).unwrap())
    }

    #[tokio::test]
    async fn test_create_generates_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let factory = ProcessNodeFactory::new(config.clone(), fake_binary(dir.path()));

        let node = factory.create(1).await.unwrap();
        assert_eq!(node.index(), 1);
        assert_ne!(node.private_addr(), node.public_addr());

        let public = dir.path().join("public-1.json");
        node.write_public(&public).await.unwrap();
        assert!(std::fs::read_to_string(&public).unwrap().contains("address"));
        assert!(node.ping().await);
    }

    #[tokio::test]
    async fn test_get_beacon_parses_output() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::new(1, "127.0.0.1:1", "127.0.0.1:2", "3");
        let node = ProcessNode::new(identity, config(dir.path()), fake_binary(dir.path()));

        let (value, command) = node.get_beacon(Path::new("group.json"), 5).await.unwrap();
        assert_eq!(value.round, 5);
        assert_eq!(value.signature, vec![0xab, 0xcd]);
        assert!(command.ends_with("get public --round 5 group.json"));
    }

    #[tokio::test]
    async fn test_refused_follower_reports_unreachable_leader() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::new(2, "127.0.0.1:1", "127.0.0.1:2", "3");
        let node = ProcessNode::new(identity, config(dir.path()), fake_binary(dir.path()));
        let params = DkgParams {
            nodes: 3,
            threshold: 2,
            period: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
            beacon_offset: 2,
        };

        node.run_dkg(&params, &Role::Leader).await.unwrap();
        let follower = Role::Follower {
            leader: "127.0.0.1:9".into(),
        };
        let err = node.run_dkg(&params, &follower).await.unwrap_err();
        assert!(matches!(err, Error::LeaderUnreachable(ref leader) if leader == "127.0.0.1:9"));
    }

    #[tokio::test]
    async fn test_failed_command_and_binary_update() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::new(1, "127.0.0.1:1", "127.0.0.1:2", "3");
        let node = ProcessNode::new(identity, config(dir.path()), fake_binary(dir.path()));

        assert!(!node.chain_info().await);
        assert!(matches!(node.get_group().await, Err(Error::Node(_))));
        assert_eq!(node.log_output().await.unwrap(), "");

        assert!(node.update_binary(Path::new("/nonexistent/node")));
        assert!(!node.ping().await);
    }
}
