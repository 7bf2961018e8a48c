//! Spawning, wiring and reaping of external pipelines.
//!
//! Every pipe end and redirection file is an [`OwnedFd`] held by exactly one
//! owner, so it is closed on every exit path by `Drop`. Pipes are created
//! close-on-exec: `dup2` onto stdin/stdout clears the flag on the copies a
//! stage actually uses, and every other end vanishes when the child execs.

use std::ffi::CString;
use std::ptr;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, dup2, fork, pipe2};
use tracing::{debug, info, warn};

use crate::command::{EXEC_FAILED, ExitStatus, Pipeline, Stage};
use crate::errors::{Result, ShellError};
use crate::redirect::{open_input, open_output};

/// Result of one stage once the pipeline has finished.
#[derive(Debug)]
pub enum StageOutcome {
    /// The stage reached a terminal state.
    Finished(ExitStatus),
    /// The stage never ran, or could not be reaped.
    Aborted(ShellError),
}

/// Outcomes of every stage of a finished pipeline, in stage order.
#[derive(Debug)]
pub struct PipelineReport {
    pipes: usize,
    outcomes: Vec<StageOutcome>,
}

impl PipelineReport {
    /// Number of pipes that were allocated for the run.
    pub fn pipe_count(&self) -> usize {
        self.pipes
    }

    pub fn stages(&self) -> &[StageOutcome] {
        &self.outcomes
    }

    /// The pipeline's status: the last stage's terminal state, or the error
    /// that kept it from running.
    pub fn into_status(mut self) -> Result<ExitStatus> {
        match self.outcomes.pop() {
            Some(StageOutcome::Finished(status)) => Ok(status),
            Some(StageOutcome::Aborted(err)) => Err(err),
            None => Err(ShellError::syntax("empty pipeline stage")),
        }
    }
}

/// Read and write ends of the `stages - 1` inter-stage pipes.
///
/// Ends are taken out as stages are spawned; whatever is left is closed when
/// the set is dropped.
struct PipeSet {
    readers: Vec<Option<OwnedFd>>,
    writers: Vec<Option<OwnedFd>>,
}

impl PipeSet {
    fn allocate(count: usize) -> nix::Result<Self> {
        let mut readers = Vec::with_capacity(count);
        let mut writers = Vec::with_capacity(count);
        for _ in 0..count {
            let (read, write) = cloexec_pipe()?;
            readers.push(Some(read));
            writers.push(Some(write));
        }
        Ok(Self { readers, writers })
    }

    fn len(&self) -> usize {
        self.readers.len()
    }

    fn take_reader(&mut self, index: usize) -> Option<OwnedFd> {
        self.readers.get_mut(index).and_then(Option::take)
    }

    fn take_writer(&mut self, index: usize) -> Option<OwnedFd> {
        self.writers.get_mut(index).and_then(Option::take)
    }
}

fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC)
}

/// Per-stage lifecycle inside the orchestrator.
///
/// Created and spawned are transient: a stage is created when its fds are
/// opened and counts as spawned from `fork` until the child either execs or
/// reports the errno that stopped it.
#[derive(Debug)]
enum StageState {
    /// The child replaced itself with the target program.
    Running(Pid),
    /// The child failed to exec and still has to be reaped.
    ExecFailed(Pid, String),
    Settled(StageOutcome),
}

impl StageState {
    fn reap(self) -> StageOutcome {
        match self {
            StageState::Settled(outcome) => outcome,
            StageState::Running(pid) => match wait_terminal(pid) {
                Ok(status) => StageOutcome::Finished(status),
                Err(err) => {
                    warn!(%pid, error = %err, "could not reap stage");
                    StageOutcome::Aborted(err)
                }
            },
            StageState::ExecFailed(pid, reason) => {
                if let Err(err) = wait_terminal(pid) {
                    warn!(%pid, error = %err, "could not reap failed stage");
                }
                StageOutcome::Finished(ExitStatus::SpawnFailed(reason))
            }
        }
    }
}

/// Runs pipelines of external programs as one OS process per stage.
///
/// The first stage reads from the executor's stdin and the last stage writes
/// to its stdout unless redirected. By default these are the interpreter's
/// own fds 0 and 1.
#[derive(Debug, Default)]
pub struct PipelineExecutor {
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
}

impl PipelineExecutor {
    /// Use `stdin` / `stdout` in place of the inherited streams. `None` keeps
    /// the inherited one.
    pub fn with_streams(stdin: Option<OwnedFd>, stdout: Option<OwnedFd>) -> Self {
        Self { stdin, stdout }
    }

    /// Spawn every stage, wait for all of them and report their outcomes.
    ///
    /// Returns `Err` only when a pipe or a process could not be created; any
    /// stage that was already running is still reaped first.
    pub fn execute(&self, pipeline: &Pipeline) -> Result<PipelineReport> {
        let mut pipes = PipeSet::allocate(pipeline.len() - 1)
            .map_err(|source| ShellError::Spawn { stage: 0, source })?;
        let pipe_count = pipes.len();
        debug!(stages = pipeline.len(), pipes = pipe_count, "allocated pipeline");

        let (states, spawn_error) = self.spawn_all(pipeline, &mut pipes);
        // The orchestrator must hold no write end while it waits, or readers
        // downstream never see end-of-stream.
        drop(pipes);

        let outcomes: Vec<StageOutcome> = states.into_iter().map(StageState::reap).collect();
        for (index, outcome) in outcomes.iter().enumerate() {
            if let StageOutcome::Finished(status) = outcome {
                debug!(stage = index, %status, "stage finished");
            }
        }

        match spawn_error {
            Some(err) => Err(err),
            None => Ok(PipelineReport {
                pipes: pipe_count,
                outcomes,
            }),
        }
    }

    fn spawn_all(
        &self,
        pipeline: &Pipeline,
        pipes: &mut PipeSet,
    ) -> (Vec<StageState>, Option<ShellError>) {
        let last = pipeline.len() - 1;
        let mut states = Vec::with_capacity(pipeline.len());

        for (index, stage) in pipeline.stages().iter().enumerate() {
            // Take this stage's pipe ends first so they are closed in the
            // orchestrator whatever happens to the stage.
            let piped_in = if index > 0 { pipes.take_reader(index - 1) } else { None };
            let piped_out = if index < last { pipes.take_writer(index) } else { None };

            let io = match StageIo::open(stage, piped_in, piped_out) {
                Ok(io) => io,
                Err(err) => {
                    warn!(stage = index, error = %err, "redirection failed, stage skipped");
                    states.push(StageState::Settled(StageOutcome::Aborted(err)));
                    continue;
                }
            };

            match self.spawn_stage(index, stage, io) {
                Ok(state) => states.push(state),
                Err(err) => return (states, Some(err)),
            }
        }

        (states, None)
    }

    fn spawn_stage(&self, index: usize, stage: &Stage, io: StageIo) -> Result<StageState> {
        let argv = match c_argv(stage) {
            Ok(argv) => argv,
            Err(reason) => {
                return Ok(StageState::Settled(StageOutcome::Finished(
                    ExitStatus::SpawnFailed(reason),
                )));
            }
        };
        // Everything the child touches is prepared here: the child must not
        // allocate between fork and exec.
        let argv_ptrs = exec_array(&argv);
        let diagnostic = format!("pipesh: {}: ", stage.program()).into_bytes();
        let stdin = io
            .input
            .as_ref()
            .or(self.stdin.as_ref())
            .map(AsRawFd::as_raw_fd);
        let stdout = io
            .output
            .as_ref()
            .or(self.stdout.as_ref())
            .map(AsRawFd::as_raw_fd);

        let (report_read, report_write) =
            cloexec_pipe().map_err(|source| ShellError::Spawn { stage: index, source })?;

        // SAFETY: the child only calls dup2, execvp, write and _exit on data
        // prepared before the fork; `argv` outlives `argv_ptrs`.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                exec_child(&argv_ptrs, stdin, stdout, report_write.as_raw_fd(), &diagnostic)
            }
            Ok(ForkResult::Parent { child }) => {
                drop(report_write);
                drop(io);
                info!(stage = index, pid = %child, program = stage.program(), "spawned stage");

                Ok(match read_exec_error(report_read) {
                    Some(reason) => {
                        let err = ShellError::Exec {
                            program: stage.program().to_string(),
                            reason,
                        };
                        debug!(stage = index, pid = %child, error = %err, "exec failed");
                        StageState::ExecFailed(child, err.to_string())
                    }
                    None => StageState::Running(child),
                })
            }
            Err(source) => {
                warn!(stage = index, error = %source, "fork failed");
                Err(ShellError::Spawn { stage: index, source })
            }
        }
    }
}

/// The fds a single stage reads from and writes to, when they are not the
/// executor's defaults.
struct StageIo {
    input: Option<OwnedFd>,
    output: Option<OwnedFd>,
}

impl StageIo {
    /// Explicit redirections take precedence over pipe ends. A displaced pipe
    /// end is closed here, so the neighbouring stage sees EOF or EPIPE.
    fn open(stage: &Stage, piped_in: Option<OwnedFd>, piped_out: Option<OwnedFd>) -> Result<Self> {
        let input = match stage.input() {
            Some(path) => Some(OwnedFd::from(open_input(path)?)),
            None => piped_in,
        };
        let output = match stage.output() {
            Some(path) => Some(OwnedFd::from(open_output(path)?)),
            None => piped_out,
        };
        Ok(Self { input, output })
    }
}

fn c_argv(stage: &Stage) -> std::result::Result<Vec<CString>, String> {
    stage
        .argv()
        .iter()
        .map(|arg| CString::new(arg.as_bytes()).map_err(|_| format!("{arg:?}: argument contains NUL byte")))
        .collect()
}

/// Null-terminated pointer array for `execvp`, borrowing from `argv`.
fn exec_array(argv: &[CString]) -> Vec<*const libc::c_char> {
    argv.iter()
        .map(|arg| arg.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Runs in the forked child. Never returns into shell logic.
fn exec_child(
    argv: &[*const libc::c_char],
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    report: RawFd,
    diagnostic: &[u8],
) -> ! {
    let errno = match redirect_stdio(stdin, stdout) {
        Err(errno) => errno,
        Ok(()) => {
            // SAFETY: `argv` is a null-terminated array of live C strings.
            unsafe { libc::execvp(argv[0], argv.as_ptr()) };
            Errno::last()
        }
    };

    let code = (errno as i32).to_ne_bytes();
    let reason = errno.desc().as_bytes();
    // SAFETY: raw writes of live buffers, then _exit without running
    // destructors or flushing stdio.
    unsafe {
        libc::write(report, code.as_ptr().cast(), code.len());
        libc::write(libc::STDERR_FILENO, diagnostic.as_ptr().cast(), diagnostic.len());
        libc::write(libc::STDERR_FILENO, reason.as_ptr().cast(), reason.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        libc::_exit(EXEC_FAILED)
    }
}

fn redirect_stdio(stdin: Option<RawFd>, stdout: Option<RawFd>) -> nix::Result<()> {
    if let Some(fd) = stdin {
        dup2(fd, libc::STDIN_FILENO)?;
    }
    if let Some(fd) = stdout {
        dup2(fd, libc::STDOUT_FILENO)?;
    }
    Ok(())
}

/// Block until the child either execs (EOF) or reports an exec errno.
fn read_exec_error(report: OwnedFd) -> Option<String> {
    let mut buf = Vec::with_capacity(4);
    File::from(report).read_to_end(&mut buf).ok()?;
    let code: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    Some(std::io::Error::from_raw_os_error(i32::from_ne_bytes(code)).to_string())
}

/// Wait until `pid` exits or is killed. Stop/continue notifications are not
/// terminal and are waited through.
fn wait_terminal(pid: Pid) -> Result<ExitStatus> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ExitStatus::Signaled(signal as i32)),
            Ok(other) => debug!(%pid, status = ?other, "stage not terminal yet"),
            Err(Errno::EINTR) => {}
            Err(source) => return Err(ShellError::Wait { pid, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::split_into_tokens;
    use crate::parser::build_pipeline;
    use std::fs;
    use std::path::Path;

    fn pipeline(line: &str) -> Pipeline {
        build_pipeline(&split_into_tokens(line)).unwrap()
    }

    /// Executor whose inherited stdout is a fresh file in `dir`.
    fn capturing(dir: &Path) -> (PipelineExecutor, std::path::PathBuf) {
        let path = dir.join("captured");
        let file = fs::File::create(&path).unwrap();
        (PipelineExecutor::with_streams(None, Some(file.into())), path)
    }

    #[test]
    fn test_pipe_count_is_stages_minus_one() {
        let executor = PipelineExecutor::default();
        for (line, pipes) in [("true", 0), ("true | true", 1), ("true | true | true | true", 3)] {
            let report = executor.execute(&pipeline(line)).unwrap();
            assert_eq!(report.pipe_count(), pipes, "{line}");
            assert_eq!(report.stages().len(), pipes + 1);
        }
    }

    #[test]
    fn test_echo_through_cat() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, captured) = capturing(dir.path());

        let status = executor.execute(&pipeline("echo hi | cat")).unwrap().into_status().unwrap();

        assert_eq!(status, ExitStatus::Exited(0));
        assert_eq!(fs::read_to_string(captured).unwrap(), "hi\n");
    }

    #[test]
    fn test_three_stage_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, captured) = capturing(dir.path());

        let status = executor
            .execute(&pipeline("printf b\\na\\nc\\n | sort | head -n 2"))
            .unwrap()
            .into_status()
            .unwrap();

        assert!(status.success());
        assert_eq!(fs::read_to_string(captured).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_last_stage_status_wins() {
        let executor = PipelineExecutor::default();
        let status = executor.execute(&pipeline("false | true")).unwrap().into_status().unwrap();
        assert_eq!(status, ExitStatus::Exited(0));

        let report = executor.execute(&pipeline("true | false")).unwrap();
        assert!(matches!(report.stages()[0], StageOutcome::Finished(ExitStatus::Exited(0))));
        assert_eq!(report.into_status().unwrap(), ExitStatus::Exited(1));
    }

    #[test]
    fn test_signaled_stage() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("suicide.sh");
        fs::write(&script, "#!/bin/sh\nkill -9 $$\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let executor = PipelineExecutor::default();
        let status = executor
            .execute(&pipeline(&script.display().to_string()))
            .unwrap()
            .into_status()
            .unwrap();
        assert_eq!(status, ExitStatus::Signaled(9));
        assert_eq!(status.code(), 137);
    }

    #[test]
    fn test_exec_array_is_null_terminated() {
        let line = pipeline("ls -l /tmp");
        let argv = c_argv(&line.stages()[0]).unwrap();
        let ptrs = exec_array(&argv);
        assert_eq!(ptrs.len(), 4);
        assert_eq!(ptrs[0], argv[0].as_ptr());
        assert!(ptrs[3].is_null());
    }

    #[test]
    fn test_stopped_stage_is_waited_through() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("stop_then_exit.sh");
        fs::write(
            &script,
            "#!/bin/sh\n(sleep 0.5; kill -CONT $$) &\nkill -STOP $$\nexit 5\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let executor = PipelineExecutor::default();
        let status = executor
            .execute(&pipeline(&script.display().to_string()))
            .unwrap()
            .into_status()
            .unwrap();

        assert_eq!(status, ExitStatus::Exited(5));
    }

    #[test]
    fn test_unknown_program_is_spawn_failed() {
        let executor = PipelineExecutor::default();
        let status = executor
            .execute(&pipeline("definitely-not-a-real-program-4242"))
            .unwrap()
            .into_status()
            .unwrap();
        match status {
            ExitStatus::SpawnFailed(reason) => assert!(reason.contains("No such file")),
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_middle_stage_does_not_hang() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, captured) = capturing(dir.path());

        let report = executor
            .execute(&pipeline("echo x | no-such-program-4242 | cat"))
            .unwrap();

        assert!(matches!(
            report.stages()[1],
            StageOutcome::Finished(ExitStatus::SpawnFailed(_))
        ));
        assert_eq!(report.into_status().unwrap(), ExitStatus::Exited(0));
        assert_eq!(fs::read_to_string(captured).unwrap(), "");
    }

    #[test]
    fn test_missing_input_aborts_only_that_stage() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        let executor = PipelineExecutor::default();

        let report = executor
            .execute(&pipeline(&format!("cat < {} | true", missing.display())))
            .unwrap();

        assert!(matches!(report.stages()[0], StageOutcome::Aborted(ShellError::Io { .. })));
        assert_eq!(report.into_status().unwrap(), ExitStatus::Exited(0));

        let single = executor
            .execute(&pipeline(&format!("cat < {}", missing.display())))
            .unwrap();
        assert!(matches!(single.into_status(), Err(ShellError::Io { .. })));
    }

    #[test]
    fn test_output_redirect_on_last_stage() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let executor = PipelineExecutor::default();

        executor
            .execute(&pipeline(&format!("printf hello | tr a-z A-Z > {}", out.display())))
            .unwrap();

        assert_eq!(fs::read_to_string(out).unwrap(), "HELLO");
    }

    #[test]
    fn test_input_redirect_feeds_first_stage() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "one\ntwo\nthree\n").unwrap();
        let (executor, captured) = capturing(dir.path());

        executor
            .execute(&pipeline(&format!("wc -l < {}", input.display())))
            .unwrap();

        assert_eq!(fs::read_to_string(captured).unwrap().trim(), "3");
    }
}
