use std::io::{BufRead, BufReader, Error, ErrorKind};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use timeout_readwrite::TimeoutReader;

use crate::cmd::command::CommandError::{ExecutionError, ExitStatusError, TimeoutError};

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("Error while executing command")]
    ExecutionError(#[from] Error),

    #[error("Command terminated with a non success exit status code: {0}")]
    ExitStatusError(ExitStatus),

    #[error("Command killed due to timeout: {0}")]
    TimeoutError(String),
}

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// A local process bounded by a wall-clock deadline. Used to drive the `ssh`
/// binary against remote hosts; the child is always reaped, SIGINT first and
/// SIGKILL once the grace period runs out.
pub struct ShellCommand {
    command: Command,
}

impl ShellCommand {
    pub fn new(binary: &str, args: &[&str]) -> ShellCommand {
        let mut command = Command::new(binary);
        command.args(args);
        ShellCommand { command }
    }

    fn kill(&self, cmd_handle: &mut Child) {
        info!("killing command: {:?}", cmd_handle);

        // SIGINT first so the process gets a chance to shutdown gracefully
        unsafe {
            let pid = cmd_handle.id() as i32;
            let _ = libc::kill(pid, libc::SIGINT);
        }

        let killed_since = Instant::now();
        while let Ok(None) = cmd_handle.try_wait() {
            if killed_since.elapsed() > KILL_GRACE_PERIOD {
                info!("command still running after grace period, hard killing it");
                let _ = cmd_handle.kill();
            }
            std::thread::sleep(Duration::from_millis(500));
        }

        let _ = cmd_handle.wait();
    }

    pub fn exec_with_timeout<STDOUT, STDERR>(
        &mut self,
        stdout_output: &mut STDOUT,
        stderr_output: &mut STDERR,
        timeout: Duration,
    ) -> Result<(), CommandError>
    where
        STDOUT: FnMut(String),
        STDERR: FnMut(String),
    {
        debug!("command: {:?}", self.command);
        let started = Instant::now();
        let mut cmd_handle = self
            .command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ExecutionError)?;

        let reader_timeout = Duration::from_secs(1);
        let stdout = cmd_handle
            .stdout
            .take()
            .ok_or_else(|| ExecutionError(Error::new(ErrorKind::BrokenPipe, "Cannot get stdout for command")))?;
        let mut stdout_reader = BufReader::new(TimeoutReader::new(stdout, reader_timeout)).lines();

        let stderr = cmd_handle
            .stderr
            .take()
            .ok_or_else(|| ExecutionError(Error::new(ErrorKind::BrokenPipe, "Cannot get stderr for command")))?;
        let mut stderr_reader = BufReader::new(TimeoutReader::new(
            stderr,
            Duration::from_secs(0), // don't block on stderr
        ))
        .lines();

        let mut stdout_closed = false;
        let mut stderr_closed = false;
        while (!stdout_closed || !stderr_closed) && started.elapsed() < timeout {
            while !stdout_closed {
                let line = match stdout_reader.next() {
                    Some(line) => line,
                    None => {
                        stdout_closed = true;
                        break;
                    }
                };

                match line {
                    Err(ref err) if err.kind() == ErrorKind::TimedOut => break,
                    Ok(line) => stdout_output(line),
                    Err(err) => {
                        error!("error on stdout of cmd {:?}: {:?}", self.command, err);
                        stdout_closed = true;
                        break;
                    }
                }

                if started.elapsed() >= timeout {
                    break;
                }
            }

            while !stderr_closed {
                let line = match stderr_reader.next() {
                    Some(line) => line,
                    None => {
                        stderr_closed = true;
                        break;
                    }
                };

                match line {
                    Err(ref err) if err.kind() == ErrorKind::TimedOut => break,
                    Ok(line) => stderr_output(line),
                    Err(err) => {
                        error!("error on stderr of cmd {:?}: {:?}", self.command, err);
                        stderr_closed = true;
                        break;
                    }
                }

                if started.elapsed() >= timeout {
                    break;
                }
            }
        }

        // Wait for the process to exit before reaching the deadline, kill it otherwise
        let exit_status;
        loop {
            match cmd_handle.try_wait() {
                Ok(Some(status)) => {
                    exit_status = status;
                    break;
                }
                Ok(None) => {
                    if started.elapsed() >= timeout {
                        let msg = format!("command {:?} ran for more than {}s", self.command, timeout.as_secs());
                        warn!("{}", msg);
                        self.kill(&mut cmd_handle);

                        // drain whatever is left
                        while let Some(Ok(line)) = stdout_reader.next() {
                            stdout_output(line);
                        }
                        while let Some(Ok(line)) = stderr_reader.next() {
                            stderr_output(line);
                        }

                        return Err(TimeoutError(msg));
                    }
                }
                Err(err) => return Err(ExecutionError(err)),
            };

            std::thread::sleep(Duration::from_millis(100));
        }

        if !exit_status.success() {
            debug!("command: {:?} terminated with error exit status {:?}", self.command, exit_status);
            return Err(ExitStatusError(exit_status));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandError, ShellCommand};
    use std::time::Duration;

    #[test]
    fn test_exit_status_error() {
        let mut cmd = ShellCommand::new("false", &[]);
        let ret = cmd.exec_with_timeout(&mut |_| {}, &mut |_| {}, Duration::from_secs(5));
        assert!(matches!(ret, Err(CommandError::ExitStatusError(_))));
    }

    #[test]
    fn test_command_with_timeout() {
        let mut cmd = ShellCommand::new("sleep", &["120"]);
        let ret = cmd.exec_with_timeout(&mut |_| {}, &mut |_| {}, Duration::from_secs(2));
        assert!(matches!(ret, Err(CommandError::TimeoutError(_))));

        let mut cmd = ShellCommand::new("sleep", &["1"]);
        let ret = cmd.exec_with_timeout(&mut |_| {}, &mut |_| {}, Duration::from_secs(3));
        assert!(ret.is_ok());
    }

    #[test]
    fn test_output_capture() {
        let mut output = String::new();
        let mut cmd = ShellCommand::new("echo", &["hello"]);
        let ret = cmd.exec_with_timeout(&mut |line| output.push_str(&line), &mut |_| {}, Duration::from_secs(5));
        assert!(ret.is_ok());
        assert_eq!(output, "hello");
    }
}
