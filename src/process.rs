//! External process contract: role scripts and the node binary.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::error::{Result, ScenarioError};
use crate::exchange::PeerDescriptor;
use crate::role::{WorkerEnv, ENV_HOME};

/// One invocation of an external program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeCommand {
    program: String,
    args: Vec<String>,
    envs: BTreeMap<String, String>,
    discard_stdout: bool,
}

impl NodeCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: BTreeMap::new(),
            discard_stdout: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    /// Drop stdout when the command runs with inherited stdio.
    pub fn discard_stdout(mut self) -> Self {
        self.discard_stdout = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.envs.get(key).map(String::as_str)
    }

    /// Program and arguments joined by spaces.
    pub fn line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line())
    }
}

/// Exit code plus stdout and stderr, concatenated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub output: Vec<u8>,
}

impl CommandOutput {
    pub fn success(output: impl Into<Vec<u8>>) -> Self {
        Self {
            code: Some(0),
            output: output.into(),
        }
    }

    pub fn exit(code: i32, output: impl Into<Vec<u8>>) -> Self {
        Self {
            code: Some(code),
            output: output.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }

    pub fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "termination by signal".to_string(),
        }
    }

    /// Turns a non-zero exit into `ScenarioError::Process`.
    pub fn check(self, cmd: &NodeCommand) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ScenarioError::Process {
                command: cmd.line(),
                status: self.status(),
                output: self.text().trim().to_string(),
            })
        }
    }
}

#[async_trait]
pub trait NodeRunner: Send + Sync {
    /// Runs to completion and captures combined output. Errors only when the
    /// program cannot be started; the exit code is left to the caller.
    async fn output(&self, cmd: &NodeCommand) -> Result<CommandOutput>;

    /// Runs to completion with inherited stdio. A non-zero exit is an error.
    async fn run(&self, cmd: &NodeCommand, cancel: &CancellationToken) -> Result<()>;
}

/// Runs a role script to completion, logging its combined output.
pub async fn run_script(runner: &dyn NodeRunner, cmd: &NodeCommand) -> Result<CommandOutput> {
    let out = runner.output(cmd).await?;
    if !out.is_success() {
        error!(command = %cmd, output = %out.text().trim(), "Script failed");
    }
    let out = out.check(cmd)?;
    if !out.output.is_empty() {
        info!(command = %cmd, output = %out.text().trim(), "Script output");
    }
    Ok(out)
}

/// Builds the commands of the node binary contract for one worker.
pub struct NodeCli<'a> {
    config: &'a NodeConfig,
    home: Option<&'a str>,
}

impl<'a> NodeCli<'a> {
    pub fn new(config: &'a NodeConfig, env: &'a WorkerEnv) -> Self {
        Self {
            config,
            home: env.get(ENV_HOME),
        }
    }

    fn command(&self, program: &str) -> NodeCommand {
        let cmd = NodeCommand::new(program);
        match self.home {
            Some(home) => cmd.env(ENV_HOME, home),
            None => cmd,
        }
    }

    fn node(&self) -> NodeCommand {
        self.command(&self.config.binary)
    }

    pub fn script(&self, path: &Path) -> NodeCommand {
        self.command("sh").arg(path.to_string_lossy())
    }

    pub fn start(&self) -> NodeCommand {
        self.node()
            .arg("start")
            .arg("--log_level")
            .arg(&self.config.log_level)
            .discard_stdout()
    }

    pub fn start_with_seed(&self, seed: &PeerDescriptor) -> NodeCommand {
        self.node()
            .arg("start")
            .arg("--p2p.seeds")
            .arg(seed.to_string())
    }

    pub fn show_node_id(&self) -> NodeCommand {
        self.node().arg("tendermint").arg("show-node-id")
    }

    pub fn query_block(&self) -> NodeCommand {
        self.node().arg("query").arg("block")
    }
}

/// Runs commands as real child processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    fn command(cmd: &NodeCommand) -> Command {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(&cmd.envs)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl NodeRunner for SystemRunner {
    async fn output(&self, cmd: &NodeCommand) -> Result<CommandOutput> {
        let out = Self::command(cmd)
            .output()
            .await
            .map_err(|e| ScenarioError::io("run", &cmd.program, e))?;

        let mut output = out.stdout;
        output.extend_from_slice(&out.stderr);
        Ok(CommandOutput {
            code: out.status.code(),
            output,
        })
    }

    async fn run(&self, cmd: &NodeCommand, cancel: &CancellationToken) -> Result<()> {
        let stdout = if cmd.discard_stdout {
            Stdio::null()
        } else {
            Stdio::inherit()
        };
        let mut child = Self::command(cmd)
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ScenarioError::io("spawn", &cmd.program, e))?;

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status.map_err(|e| ScenarioError::io("wait for", &cmd.program, e))?,
            None => {
                if let Err(e) = child.kill().await {
                    warn!(command = %cmd, error = %e, "Failed to kill cancelled process");
                }
                return Err(ScenarioError::Cancelled(format!("running `{cmd}`")));
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(ScenarioError::Process {
                command: cmd.line(),
                status: status.to_string(),
                output: String::new(),
            })
        }
    }
}

type Handler = Arc<dyn Fn(&NodeCommand) -> Result<CommandOutput> + Send + Sync>;

enum Rule {
    /// Replies in order; the last reply repeats.
    Replies(VecDeque<CommandOutput>),
    Handler(Handler),
    /// Runs until cancelled, like a long-lived node.
    Serve,
}

/// Stands in for the node binary and role scripts, keyed by command line.
///
/// Commands without a rule succeed with empty output. Every invocation is
/// recorded.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    rules: Arc<Mutex<HashMap<String, Rule>>>,
    calls: Arc<Mutex<Vec<NodeCommand>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(
        self,
        line: impl Into<String>,
        replies: impl IntoIterator<Item = CommandOutput>,
    ) -> Self {
        lock(&self.rules).insert(line.into(), Rule::Replies(replies.into_iter().collect()));
        self
    }

    pub fn handle<F>(self, line: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&NodeCommand) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        lock(&self.rules).insert(line.into(), Rule::Handler(Arc::new(handler)));
        self
    }

    /// `run` of `line` blocks until its token is cancelled.
    pub fn serve(self, line: impl Into<String>) -> Self {
        lock(&self.rules).insert(line.into(), Rule::Serve);
        self
    }

    fn serves(&self, line: &str) -> bool {
        matches!(lock(&self.rules).get(line), Some(Rule::Serve))
    }

    pub fn calls(&self) -> Vec<NodeCommand> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, line: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.line() == line).count()
    }

    fn dispatch(&self, cmd: &NodeCommand) -> Result<CommandOutput> {
        lock(&self.calls).push(cmd.clone());

        let handler = {
            let mut rules = lock(&self.rules);
            match rules.get_mut(&cmd.line()) {
                None | Some(Rule::Serve) => return Ok(CommandOutput::success(Vec::new())),
                Some(Rule::Replies(replies)) => {
                    let reply = if replies.len() > 1 {
                        replies.pop_front()
                    } else {
                        replies.front().cloned()
                    };
                    return Ok(reply.unwrap_or_else(|| CommandOutput::success(Vec::new())));
                }
                Some(Rule::Handler(handler)) => handler.clone(),
            }
        };
        handler(cmd)
    }
}

#[async_trait]
impl NodeRunner for ScriptedRunner {
    async fn output(&self, cmd: &NodeCommand) -> Result<CommandOutput> {
        self.dispatch(cmd)
    }

    async fn run(&self, cmd: &NodeCommand, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ScenarioError::Cancelled(format!("running `{cmd}`")));
        }
        if self.serves(&cmd.line()) {
            lock(&self.calls).push(cmd.clone());
            cancel.cancelled().await;
            return Err(ScenarioError::Cancelled(format!("running `{cmd}`")));
        }
        self.dispatch(cmd)?.check(cmd).map(|_| ())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_cli_builds_the_binary_contract() {
        let config = NodeConfig::default();
        let mut env = WorkerEnv::default();
        env.set(ENV_HOME, "/home/worker");
        let cli = NodeCli::new(&config, &env);

        let start = cli.start();
        assert_eq!(start.line(), "celestia-appd start --log_level error");
        assert_eq!(start.get_env(ENV_HOME), Some("/home/worker"));

        let seed: PeerDescriptor = "nodeid@10.0.0.2:26656".parse().unwrap();
        assert_eq!(
            cli.start_with_seed(&seed).line(),
            "celestia-appd start --p2p.seeds nodeid@10.0.0.2:26656"
        );
        assert_eq!(cli.show_node_id().line(), "celestia-appd tendermint show-node-id");
        assert_eq!(cli.query_block().line(), "celestia-appd query block");
        assert_eq!(
            cli.script(&config.fullnode_script).line(),
            "sh /opt/fullnode.sh"
        );
    }

    #[test]
    fn check_wraps_failures_with_output() {
        let cmd = NodeCommand::new("sh").arg("/opt/validator.sh");
        let err = CommandOutput::exit(2, "keyring locked\n")
            .check(&cmd)
            .unwrap_err();
        match err {
            ScenarioError::Process {
                command,
                status,
                output,
            } => {
                assert_eq!(command, "sh /opt/validator.sh");
                assert_eq!(status, "exit code 2");
                assert_eq!(output, "keyring locked");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_replies_advance_then_repeat() {
        let runner = ScriptedRunner::new().reply(
            "node query block",
            [CommandOutput::exit(1, ""), CommandOutput::success("7")],
        );
        let cmd = NodeCommand::new("node").arg("query").arg("block");

        assert_eq!(runner.output(&cmd).await.unwrap().code, Some(1));
        assert_eq!(runner.output(&cmd).await.unwrap().text(), "7");
        assert_eq!(runner.output(&cmd).await.unwrap().text(), "7");
        assert_eq!(runner.count("node query block"), 3);

        let other = NodeCommand::new("true");
        assert!(runner.output(&other).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn served_commands_run_until_cancelled() {
        let runner = ScriptedRunner::new().serve("node start");
        let cmd = NodeCommand::new("node").arg("start");
        let cancel = CancellationToken::new();

        let running = tokio::spawn({
            let runner = runner.clone();
            let cancel = cancel.clone();
            async move { runner.run(&cmd, &cancel).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!running.is_finished());
        assert_eq!(runner.count("node start"), 1);

        cancel.cancel();
        assert!(running.await.unwrap().unwrap_err().is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_kills_cancelled_process() {
        let cmd = NodeCommand::new("sh").arg("-c").arg("sleep 30");
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let started = std::time::Instant::now();
        let err = SystemRunner.run(&cmd, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_captures_combined_output() {
        let cmd = NodeCommand::new("sh")
            .arg("-c")
            .arg("echo out; echo err 1>&2; exit 3");
        let out = SystemRunner.output(&cmd).await.unwrap();
        assert_eq!(out.code, Some(3));
        assert!(out.text().contains("out"));
        assert!(out.text().contains("err"));

        let missing = NodeCommand::new("definitely-not-a-real-binary-xyz");
        assert!(matches!(
            SystemRunner.output(&missing).await,
            Err(ScenarioError::Io { .. })
        ));
    }
}
