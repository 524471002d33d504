use std::time::Duration;

use crate::cmd::command::ShellCommand;

const SSH_USER: &str = "ec2-user";
const CONNECT_TIMEOUT_SECS: u32 = 10;

/// Runs a shell command on a remote host over non-interactive ssh.
/// Returns true iff ssh exited with status 0 within the deadline.
pub fn run_command(address: &str, command: &str, timeout: Duration) -> bool {
    let destination = format!("{SSH_USER}@{address}");
    let connect_timeout = format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}");
    let mut cmd = ShellCommand::new(
        "ssh",
        &[
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            connect_timeout.as_str(),
            destination.as_str(),
            command,
        ],
    );

    cmd.exec_with_timeout(&mut |line| debug!("{address}: {line}"), &mut |line| debug!("{address}: {line}"), timeout)
        .is_ok()
}
