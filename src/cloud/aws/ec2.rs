use std::collections::BTreeMap;
use std::time::Duration;

use aws_sdk_ec2::client::Waiters;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_types::SdkConfig;

use crate::cloud::aws::to_utc;
use crate::cloud::{CloudError, Ec2Api, Ec2Instance};
use crate::runtime::block_on;

/// EC2 instance lifecycle waiters are bounded by the SDK itself; this is the
/// cap we hand it, aligned on the SDK defaults (40 polls of 15s).
const LIFECYCLE_WAIT: Duration = Duration::from_secs(600);

pub struct Ec2Client {
    client: aws_sdk_ec2::Client,
}

impl Ec2Client {
    pub fn new(config: &SdkConfig) -> Self {
        Ec2Client {
            client: aws_sdk_ec2::Client::new(config),
        }
    }
}

impl Ec2Api for Ec2Client {
    fn describe(&self, ids: &[String]) -> Result<BTreeMap<String, Ec2Instance>, CloudError> {
        block_on(async {
            let mut instances = BTreeMap::new();
            let mut pages = self
                .client
                .describe_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .into_paginator()
                .send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| CloudError::api("describe ec2 instances", DisplayErrorContext(e)))?;
                for reservation in page.reservations() {
                    for instance in reservation.instances() {
                        let Some(id) = instance.instance_id() else { continue };
                        instances.insert(
                            id.to_string(),
                            Ec2Instance {
                                id: id.to_string(),
                                availability_zone: instance
                                    .placement()
                                    .and_then(|p| p.availability_zone())
                                    .unwrap_or_default()
                                    .to_string(),
                                private_ip: instance.private_ip_address().map(str::to_string),
                                launch_time: instance.launch_time().and_then(to_utc),
                            },
                        );
                    }
                }
            }

            Ok(instances)
        })
    }

    fn stop_and_await(&self, ids: &[String]) -> Result<(), CloudError> {
        block_on(async {
            self.client
                .stop_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .send()
                .await
                .map_err(|e| CloudError::api("stop ec2 instances", DisplayErrorContext(e)))?;

            self.client
                .wait_until_instance_stopped()
                .set_instance_ids(Some(ids.to_vec()))
                .wait(LIFECYCLE_WAIT)
                .await
                .map_err(|e| CloudError::api("wait for ec2 instances to stop", DisplayErrorContext(e)))?;

            Ok(())
        })
    }

    fn terminate_and_await(&self, ids: &[String]) -> Result<(), CloudError> {
        block_on(async {
            self.client
                .terminate_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .send()
                .await
                .map_err(|e| CloudError::api("terminate ec2 instances", DisplayErrorContext(e)))?;

            self.client
                .wait_until_instance_terminated()
                .set_instance_ids(Some(ids.to_vec()))
                .wait(LIFECYCLE_WAIT)
                .await
                .map_err(|e| CloudError::api("wait for ec2 instances to terminate", DisplayErrorContext(e)))?;

            Ok(())
        })
    }
}
