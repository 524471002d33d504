use std::time::Duration;

use crate::cloud::{CloudError, Ec2Api, RemoteExec};
use crate::cmd::ssh;

/// Remote execution over ssh against the instance's private IP.
pub struct SshExec<'a> {
    ec2: &'a dyn Ec2Api,
}

impl<'a> SshExec<'a> {
    pub fn new(ec2: &'a dyn Ec2Api) -> Self {
        SshExec { ec2 }
    }

    fn private_ip(&self, ec2_id: &str) -> Result<String, CloudError> {
        let instances = self.ec2.describe(&[ec2_id.to_string()])?;
        instances
            .get(ec2_id)
            .and_then(|i| i.private_ip.clone())
            .ok_or_else(|| CloudError::api("resolve private ip", format!("no private IP found for {ec2_id}")))
    }
}

impl RemoteExec for SshExec<'_> {
    fn run(&self, ec2_id: &str, command: &str, timeout: Duration) -> Result<bool, CloudError> {
        let address = self.private_ip(ec2_id)?;
        Ok(ssh::run_command(&address, command, timeout))
    }
}
