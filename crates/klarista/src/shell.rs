use std::ffi::OsStr;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::cluster::ClusterEnv;
use crate::error::{Error, ErrorKind, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

const POLL: Duration = Duration::from_millis(50);
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_secs(5);

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the interrupt flag. Call once from `main`.
pub fn install_signal_handlers() {
    #[cfg(unix)]
    {
        let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Child stdout is forwarded to our stderr.
    #[default]
    Stderr,
    Capture,
    /// Both stdout and stderr are dropped.
    Discard,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub output: OutputMode,
}

impl RunOptions {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(dir.into()),
            output: OutputMode::Stderr,
        }
    }

    pub fn capture(mut self) -> Self {
        self.output = OutputMode::Capture;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.output = OutputMode::Discard;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Found,
    NotFound,
}

impl Probe {
    pub fn found(self) -> bool {
        self == Probe::Found
    }
}

/// Children inherit stdin and stderr. Their stdout goes to our stderr unless
/// captured, which keeps our own stdout clean for `get` and `env`.
pub struct Shell {
    bash: String,
    env: ClusterEnv,
    cancel: &'static AtomicBool,
}

impl Shell {
    pub fn new(bash: impl Into<String>, env: ClusterEnv) -> Self {
        Self {
            bash: bash.into(),
            env,
            cancel: &INTERRUPTED,
        }
    }

    pub fn with_cancel_flag(mut self, flag: &'static AtomicBool) -> Self {
        self.cancel = flag;
        self
    }

    pub fn env(&self) -> &ClusterEnv {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut ClusterEnv {
        &mut self.env
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled() {
            return Err(Error::new(ErrorKind::Cancelled, "interrupted"));
        }
        Ok(())
    }

    /// Run to completion; a non-zero exit is an error. Returns captured stdout
    /// (empty unless `OutputMode::Capture`).
    pub fn run<I, S>(&self, program: &str, args: I, opts: &RunOptions) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args);
        let shown = describe(&cmd);
        let (status, stdout) = self.execute(cmd, opts, &shown)?;
        if !status.success() {
            return Err(Error::subprocess(format!("`{shown}` failed: {status}")));
        }
        Ok(stdout)
    }

    /// Like `run`, but a non-zero exit is returned instead of failing.
    pub fn run_status<I, S>(
        &self,
        program: &str,
        args: I,
        opts: &RunOptions,
    ) -> Result<(ExitStatus, String)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args);
        let shown = describe(&cmd);
        self.execute(cmd, opts, &shown)
    }

    pub fn script(&self, script: &str, opts: &RunOptions) -> Result<String> {
        self.run(&self.bash, ["-c", script], opts)
    }

    /// Exit status 0 is `Found`, any other exit is `NotFound`. Failing to run
    /// the command at all, or being interrupted, is an error.
    pub fn probe<I, S>(&self, program: &str, args: I, opts: &RunOptions) -> Result<Probe>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args);
        let shown = describe(&cmd);
        let (status, _) = self.execute(cmd, opts, &shown)?;
        tracing::debug!("probe `{shown}`: {status}");
        Ok(if status.success() {
            Probe::Found
        } else {
            Probe::NotFound
        })
    }

    pub fn probe_script(&self, script: &str, opts: &RunOptions) -> Result<Probe> {
        self.probe(&self.bash, ["-c", script], opts)
    }

    /// Sleep that wakes up early on interrupt.
    pub fn sleep(&self, d: Duration) -> Result<()> {
        let until = Instant::now() + d;
        loop {
            self.check_cancelled()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep((until - now).min(Duration::from_millis(200)));
        }
    }

    fn execute(&self, mut cmd: Command, opts: &RunOptions, shown: &str) -> Result<(ExitStatus, String)> {
        self.check_cancelled()?;
        self.env.apply(&mut cmd);
        if let Some(dir) = &opts.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::inherit());
        match opts.output {
            OutputMode::Stderr => {
                cmd.stdout(Stdio::from(std::io::stderr()));
                cmd.stderr(Stdio::inherit());
            }
            OutputMode::Capture => {
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::inherit());
            }
            OutputMode::Discard => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }

        tracing::debug!("running `{shown}`");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::subprocess(format!("failed to spawn `{shown}`: {e}")))?;

        let reader = child.stdout.take().map(|mut out| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf);
                buf
            })
        });

        let status = self.supervise(&mut child, shown)?;
        let stdout = match reader {
            Some(h) => h.join().unwrap_or_default(),
            None => Vec::new(),
        };
        Ok((status, String::from_utf8_lossy(&stdout).to_string()))
    }

    // Poll until the child exits. The interrupt flag is only consulted while
    // the child is still running.
    fn supervise(&self, child: &mut Child, shown: &str) -> Result<ExitStatus> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => {
                    return Err(Error::subprocess(format!("wait for `{shown}` failed: {e}")));
                }
            }
            if self.cancelled() {
                tracing::warn!("interrupted, stopping `{shown}`");
                stop_child(child);
                return Err(Error::new(
                    ErrorKind::Cancelled,
                    format!("`{shown}` was interrupted"),
                ));
            }
            std::thread::sleep(POLL);
        }
    }
}

fn stop_child(child: &mut Child) {
    #[cfg(unix)]
    {
        let _ = unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };
        let until = Instant::now() + TERM_GRACE;
        while Instant::now() < until {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            std::thread::sleep(POLL);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    parts.join(" ")
}
