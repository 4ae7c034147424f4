//! External process runner.
//!
//! Arguments may reference the stage's files and run settings through
//! placeholders; the same values are exported as environment variables so
//! scripts can read whichever is more convenient.
//!
//! | Placeholder     | Environment variable   |
//! |-----------------|------------------------|
//! | `{input:N}`     | `ADEFLOW_INPUT_<N>`    |
//! | `{output:N}`    | `ADEFLOW_OUTPUT_<N>`   |
//! | `{shards}`      | `ADEFLOW_SHARDS`       |
//! | `{shard_id}`    | `ADEFLOW_SHARD_ID`     |
//! | `{sample_size}` | `ADEFLOW_SAMPLE_SIZE`  |
//! |                 | `ADEFLOW_DEMO`         |
//!
//! Combined stdout/stderr goes to tracing and to the stage's step log.

use adeflow_logging::StepLog;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{StageContext, StageRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRunner {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child; placeholders are expanded here too.
    pub env: BTreeMap<String, String>,
    /// Defaults to the current directory.
    pub working_dir: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Values substituted into arguments and exported to the child.
struct Placeholders {
    inputs: Vec<String>,
    outputs: Vec<String>,
    shards: String,
    shard_id: String,
    sample_size: String,
    demo: bool,
}

impl Placeholders {
    fn from_context(ctx: &StageContext<'_>) -> Self {
        let shard = ctx.shard();
        Self {
            inputs: ctx
                .inputs
                .iter()
                .map(|i| i.path.display().to_string())
                .collect(),
            outputs: ctx
                .outputs
                .iter()
                .map(|o| o.temp_path().display().to_string())
                .collect(),
            shards: shard.shards().to_string(),
            shard_id: shard.shard_id().to_string(),
            sample_size: ctx
                .env
                .sample_size
                .map(|n| n.to_string())
                .unwrap_or_default(),
            demo: ctx.env.demo,
        }
    }

    fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        for (n, path) in self.inputs.iter().enumerate() {
            vars.push((format!("ADEFLOW_INPUT_{}", n), path.clone()));
        }
        for (n, path) in self.outputs.iter().enumerate() {
            vars.push((format!("ADEFLOW_OUTPUT_{}", n), path.clone()));
        }
        vars.push(("ADEFLOW_SHARDS".to_string(), self.shards.clone()));
        vars.push(("ADEFLOW_SHARD_ID".to_string(), self.shard_id.clone()));
        vars.push(("ADEFLOW_SAMPLE_SIZE".to_string(), self.sample_size.clone()));
        vars.push((
            "ADEFLOW_DEMO".to_string(),
            if self.demo { "1" } else { "0" }.to_string(),
        ));
        vars
    }

    /// Replace every `{...}` token in `arg`. Unknown or out-of-range tokens are errors.
    fn expand(&self, arg: &str) -> Result<String> {
        let mut out = String::with_capacity(arg.len());
        let mut rest = arg;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after
                .find('}')
                .ok_or_else(|| anyhow!("unterminated placeholder in argument '{}'", arg))?;
            out.push_str(&self.lookup(&after[..end], arg)?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn lookup(&self, token: &str, arg: &str) -> Result<String> {
        let indexed = |list: &[String], n: &str, what: &str| -> Result<String> {
            let n: usize = n
                .parse()
                .with_context(|| format!("bad {} index '{}' in argument '{}'", what, n, arg))?;
            list.get(n).cloned().ok_or_else(|| {
                anyhow!(
                    "argument '{}' references {} {} but the stage declares {}",
                    arg,
                    what,
                    n,
                    list.len()
                )
            })
        };
        match token.split_once(':') {
            Some(("input", n)) => indexed(&self.inputs, n, "input"),
            Some(("output", n)) => indexed(&self.outputs, n, "output"),
            None if token == "shards" => Ok(self.shards.clone()),
            None if token == "shard_id" => Ok(self.shard_id.clone()),
            None if token == "sample_size" => Ok(self.sample_size.clone()),
            _ => bail!("unknown placeholder '{{{}}}' in argument '{}'", token, arg),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

#[async_trait]
impl StageRunner for CommandRunner {
    async fn run(&self, ctx: &StageContext<'_>) -> Result<()> {
        let placeholders = Placeholders::from_context(ctx);
        let args = self
            .args
            .iter()
            .map(|a| placeholders.expand(a))
            .collect::<Result<Vec<_>>>()?;

        let mut log = StepLog::create(&ctx.env.step_log_dir, &ctx.env.run_id, ctx.name())?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .envs(placeholders.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, placeholders.expand(value)?);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(stage = ctx.name(), program = %self.program, ?args, "Spawning stage command");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.program))?;
        info!(
            "[Stage {} {}] Spawned '{}' (pid={})",
            ctx.index,
            ctx.name(),
            self.program,
            child.id().unwrap_or_default()
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to capture stderr"))?;
        let stdout_task = tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone()));
        let stderr_task = tokio::spawn(forward_lines(stderr, Stream::Stderr, tx));

        // Both senders drop once the child closes its pipes.
        while let Some((stream, line)) = rx.recv().await {
            info!(target: "adeflow::step", stage = ctx.name(), stream = stream.name(), "{}", line);
            log.line(stream.name(), &line)?;
        }
        join_forwarder(stdout_task, ctx.name(), Stream::Stdout).await;
        join_forwarder(stderr_task, ctx.name(), Stream::Stderr).await;
        let log_path = log.finish()?;

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;
        if !status.success() {
            bail!(
                "'{}' exited with {} (log: {})",
                self.program,
                status,
                log_path.display()
            );
        }
        Ok(())
    }
}

/// Returns false when the forwarder panicked or was cancelled; its remaining lines are lost.
async fn join_forwarder(task: JoinHandle<()>, stage: &str, stream: Stream) -> bool {
    match task.await {
        Ok(()) => true,
        Err(err) => {
            warn!(stage, stream = stream.name(), error = %err, "Output forwarder did not finish");
            false
        }
    }
}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = tx.send((Stream::Stderr, format!("Failed to read output: {}", err)));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholders() -> Placeholders {
        Placeholders {
            inputs: vec!["/data/parse/demo.parquet".into()],
            outputs: vec!["/data/er/.a.parquet.tmp".into(), "/data/er/.b.json.tmp".into()],
            shards: "4".into(),
            shard_id: "1".into(),
            sample_size: String::new(),
            demo: true,
        }
    }

    #[test]
    fn expands_indexed_and_scalar_placeholders() {
        let p = placeholders();
        assert_eq!(
            p.expand("--in={input:0}").unwrap(),
            "--in=/data/parse/demo.parquet"
        );
        assert_eq!(p.expand("{output:1}").unwrap(), "/data/er/.b.json.tmp");
        assert_eq!(p.expand("{shard_id}/{shards}").unwrap(), "1/4");
        assert_eq!(p.expand("--sample={sample_size}").unwrap(), "--sample=");
        assert_eq!(p.expand("plain").unwrap(), "plain");
    }

    #[test]
    fn rejects_bad_placeholders() {
        let p = placeholders();
        assert!(p.expand("{input:3}").is_err());
        assert!(p.expand("{input:x}").is_err());
        assert!(p.expand("{nope}").is_err());
        assert!(p.expand("{input:0").is_err());
    }

    #[tokio::test]
    async fn cancelled_forwarder_is_reported() {
        let stuck = tokio::spawn(std::future::pending::<()>());
        stuck.abort();
        assert!(!join_forwarder(stuck, "upper", Stream::Stdout).await);

        let done = tokio::spawn(async {});
        assert!(join_forwarder(done, "upper", Stream::Stderr).await);
    }

    #[test]
    fn exports_env_vars() {
        let vars: BTreeMap<String, String> = placeholders().env_vars().into_iter().collect();
        assert_eq!(vars["ADEFLOW_INPUT_0"], "/data/parse/demo.parquet");
        assert_eq!(vars["ADEFLOW_OUTPUT_1"], "/data/er/.b.json.tmp");
        assert_eq!(vars["ADEFLOW_SHARDS"], "4");
        assert_eq!(vars["ADEFLOW_DEMO"], "1");
    }
}
