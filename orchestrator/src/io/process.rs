//! Helpers for running child processes with timeouts and bounded output.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::RunMetrics;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Exit code reported when a command is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// stdout and stderr interleaved in the order chunks were read.
    pub combined: Vec<u8>,
    pub combined_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn truncated_notice(&self, label: &str) -> String {
        if self.combined_truncated > 0 {
            format!(
                "\n[{label} output truncated {} bytes]\n",
                self.combined_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// output stored in memory per capture (bytes beyond this are discarded while still draining
/// the pipe). On Unix the child gets its own process group, and the whole group is killed on
/// timeout so grandchildren cannot keep running.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let combined = Arc::new(Mutex::new(Capture::new(output_limit_bytes)));
    let stdout_handle = {
        let combined = Arc::clone(&combined);
        thread::spawn(move || read_stream(stdout, output_limit_bytes, &combined))
    };
    let stderr_handle = {
        let combined = Arc::clone(&combined);
        thread::spawn(move || read_stream(stderr, output_limit_bytes, &combined))
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_child(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;
    let combined = Arc::try_unwrap(combined)
        .map_err(|_| anyhow!("combined output still shared after readers finished"))?
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner);

    if combined.truncated > 0 {
        warn!(truncated = combined.truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: stdout.buf,
        stderr: stderr.buf,
        combined: combined.buf,
        combined_truncated: combined.truncated,
        timed_out,
    })
}

fn kill_child(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(exit_code = ?status.code(), "process group kill failed"),
            Err(err) => warn!(err = %err, "process group kill failed"),
        }
    }
    match child.kill() {
        Ok(()) => Ok(()),
        // Already reaped by the group kill above.
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err).context("kill command"),
    }
}

fn join_output(handle: thread::JoinHandle<Result<Capture>>) -> Result<Capture> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Bounded byte buffer that counts what it drops.
#[derive(Debug)]
struct Capture {
    buf: Vec<u8>,
    truncated: usize,
    limit: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            truncated: 0,
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let remaining = self.limit.saturating_sub(self.buf.len());
        let keep = chunk.len().min(remaining);
        self.buf.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }
}

fn read_stream<R: Read>(
    mut reader: R,
    limit: usize,
    combined: &Mutex<Capture>,
) -> Result<Capture> {
    let mut own = Capture::new(limit);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        own.push(&chunk[..n]);
        combined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(&chunk[..n]);
    }

    Ok(own)
}

/// Result of [`run_command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRun {
    /// Process exit code; [`TIMEOUT_EXIT_CODE`] on timeout or when killed by a signal.
    pub exit_code: i32,
    /// Interleaved stdout/stderr as text.
    pub output: String,
    pub timed_out: bool,
}

impl CommandRun {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Run `argv` in `working_dir`, capture combined output, enforce `timeout`.
///
/// The captured output is always written to `log_path` before returning. On
/// timeout the child is killed, the exit code is [`TIMEOUT_EXIT_CODE`] and the
/// log ends with a `TIMEOUT after <n>s` marker.
pub fn run_command(
    argv: &[String],
    working_dir: &Path,
    log_path: &Path,
    timeout: Duration,
) -> Result<CommandRun> {
    run_command_with_env(argv, working_dir, &[], log_path, timeout)
}

/// [`run_command`] with extra environment variables for the child.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or(""), timeout_secs = timeout.as_secs()))]
pub fn run_command_with_env(
    argv: &[String],
    working_dir: &Path,
    env: &[(&str, &str)],
    log_path: &Path,
    timeout: Duration,
) -> Result<CommandRun> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command line"))?;
    info!(
        command = %argv.join(" "),
        cwd = %working_dir.display(),
        "running command"
    );
    let started = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(working_dir);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let output = run_command_with_timeout(cmd, None, timeout, DEFAULT_OUTPUT_LIMIT_BYTES)
        .with_context(|| format!("run {program}"))?;

    let mut text = String::from_utf8_lossy(&output.combined).into_owned();
    text.push_str(&output.truncated_notice("command"));
    let exit_code = if output.timed_out {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("TIMEOUT after {}s\n", timeout.as_secs()));
        error!(timeout_secs = timeout.as_secs(), "command timed out");
        TIMEOUT_EXIT_CODE
    } else {
        let code = output.status.code().unwrap_or(TIMEOUT_EXIT_CODE);
        info!(
            exit_code = code,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "command finished"
        );
        code
    };

    write_log(log_path, &text)?;
    Ok(CommandRun {
        exit_code,
        output: text,
        timed_out: output.timed_out,
    })
}

fn write_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write log {}", path.display()))
}

/// Run one experiment seed and read back its `metrics.json`.
///
/// Invokes `script --config <config_path> --seed <seed> --output-dir <run_dir>` from the
/// experiment directory (the run directory's grandparent). Returns `None` when the
/// result file is absent or malformed; only failure to launch the script is an error.
pub fn run_experiment_script(
    script: &[String],
    config_path: &Path,
    run_dir: &Path,
    seed: u64,
    timeout: Duration,
) -> Result<Option<RunMetrics>> {
    if script.is_empty() {
        bail!("empty experiment script command");
    }
    fs::create_dir_all(run_dir)
        .with_context(|| format!("create run dir {}", run_dir.display()))?;

    let mut argv = script.to_vec();
    argv.extend([
        "--config".to_string(),
        config_path.display().to_string(),
        "--seed".to_string(),
        seed.to_string(),
        "--output-dir".to_string(),
        run_dir.display().to_string(),
    ]);
    let cwd: PathBuf = run_dir
        .parent()
        .and_then(Path::parent)
        .unwrap_or(run_dir)
        .to_path_buf();
    let run = run_command(&argv, &cwd, &run_dir.join("run.log"), timeout)?;

    let metrics_path = run_dir.join("metrics.json");
    if !metrics_path.exists() {
        warn!(
            run_dir = %run_dir.display(),
            exit_code = run.exit_code,
            "no metrics.json produced"
        );
        return Ok(None);
    }
    let parsed = fs::read_to_string(&metrics_path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_str::<RunMetrics>(&raw).map_err(anyhow::Error::from));
    match parsed {
        Ok(metrics) => Ok(Some(metrics)),
        Err(err) => {
            error!(run_dir = %run_dir.display(), err = %err, "metrics.json is invalid");
            Ok(None)
        }
    }
}
