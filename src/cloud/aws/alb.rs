use std::cell::RefCell;
use std::collections::BTreeMap;

use aws_sdk_elasticloadbalancingv2::types::TargetDescription;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_types::SdkConfig;

use crate::cloud::{CloudError, TargetGroupApi};
use crate::runtime::block_on;

/// Target group access. Mapping an instance back to the target groups it is
/// registered with requires walking every group, so the full snapshot is
/// taken once on first use and kept for the lifetime of this value.
pub struct TargetGroups {
    client: aws_sdk_elasticloadbalancingv2::Client,
    registered_targets: RefCell<Option<BTreeMap<String, Vec<String>>>>,
}

impl TargetGroups {
    pub fn new(config: &SdkConfig) -> Self {
        TargetGroups {
            client: aws_sdk_elasticloadbalancingv2::Client::new(config),
            registered_targets: RefCell::new(None),
        }
    }

    fn snapshot(&self) -> Result<BTreeMap<String, Vec<String>>, CloudError> {
        block_on(async {
            let mut arns = Vec::new();
            let mut pages = self.client.describe_target_groups().into_paginator().send();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| CloudError::api("describe target groups", DisplayErrorContext(e)))?;
                arns.extend(
                    page.target_groups()
                        .iter()
                        .filter_map(|g| g.target_group_arn().map(str::to_string)),
                );
            }

            let mut targets_by_group = BTreeMap::new();
            for arn in arns {
                let health = self
                    .client
                    .describe_target_health()
                    .target_group_arn(&arn)
                    .send()
                    .await
                    .map_err(|e| CloudError::api("describe target health", DisplayErrorContext(e)))?;

                let targets = health
                    .target_health_descriptions()
                    .iter()
                    .filter_map(|d| d.target().and_then(|t| t.id()).map(str::to_string))
                    .collect();
                targets_by_group.insert(arn, targets);
            }

            debug!("cached targets of {} target groups", targets_by_group.len());
            Ok(targets_by_group)
        })
    }
}

impl TargetGroupApi for TargetGroups {
    fn deregister_targets(&self, arn: &str, ec2_ids: &[String]) -> Result<(), CloudError> {
        block_on(async {
            let targets = ec2_ids
                .iter()
                .map(|id| {
                    TargetDescription::builder()
                        .id(id)
                        .build()
                        .map_err(|e| CloudError::api("build target description", e))
                })
                .collect::<Result<Vec<_>, _>>()?;

            self.client
                .deregister_targets()
                .target_group_arn(arn)
                .set_targets(Some(targets))
                .send()
                .await
                .map_err(|e| CloudError::api("deregister targets", DisplayErrorContext(e)))?;

            Ok(())
        })
    }

    fn target_groups_containing(&self, ec2_id: &str) -> Result<Vec<String>, CloudError> {
        let mut cache = self.registered_targets.borrow_mut();
        if cache.is_none() {
            *cache = Some(self.snapshot()?);
        }

        let targets_by_group = cache.as_ref().expect("cache populated above");
        Ok(targets_by_group
            .iter()
            .filter(|(_, targets)| targets.iter().any(|t| t == ec2_id))
            .map(|(arn, _)| arn.clone())
            .collect())
    }
}
