use aws_sdk_elasticloadbalancing::types::Instance;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_types::SdkConfig;

use crate::cloud::{ClassicLbApi, CloudError};
use crate::runtime::block_on;

pub struct ClassicElb {
    client: aws_sdk_elasticloadbalancing::Client,
}

impl ClassicElb {
    pub fn new(config: &SdkConfig) -> Self {
        ClassicElb {
            client: aws_sdk_elasticloadbalancing::Client::new(config),
        }
    }
}

impl ClassicLbApi for ClassicElb {
    fn deregister(&self, name: &str, ec2_ids: &[String]) -> Result<Vec<String>, CloudError> {
        block_on(async {
            let instances = ec2_ids
                .iter()
                .map(|id| Instance::builder().instance_id(id).build())
                .collect::<Vec<_>>();

            let resp = self
                .client
                .deregister_instances_from_load_balancer()
                .load_balancer_name(name)
                .set_instances(Some(instances))
                .send()
                .await
                .map_err(|e| CloudError::api("deregister instances from load balancer", DisplayErrorContext(e)))?;

            Ok(resp
                .instances()
                .iter()
                .filter_map(|i| i.instance_id().map(str::to_string))
                .collect())
        })
    }

    fn load_balancers_containing(&self, ec2_id: &str) -> Result<Vec<String>, CloudError> {
        block_on(async {
            let mut names = Vec::new();
            let mut pages = self.client.describe_load_balancers().into_paginator().send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| CloudError::api("describe load balancers", DisplayErrorContext(e)))?;
                for lb in page.load_balancer_descriptions() {
                    let attached = lb.instances().iter().any(|i| i.instance_id() == Some(ec2_id));
                    if attached {
                        if let Some(name) = lb.load_balancer_name() {
                            names.push(name.to_string());
                        }
                    }
                }
            }

            Ok(names)
        })
    }
}
