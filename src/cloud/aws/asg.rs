use aws_smithy_types::error::display::DisplayErrorContext;
use aws_types::SdkConfig;

use crate::cloud::aws::to_utc;
use crate::cloud::{AsgApi, AsgMember, CloudError, ScalingActivity};
use crate::runtime::block_on;

pub struct AutoScalingGroup {
    name: String,
    client: aws_sdk_autoscaling::Client,
}

impl AutoScalingGroup {
    pub fn new(config: &SdkConfig, name: &str) -> Self {
        AutoScalingGroup {
            name: name.to_string(),
            client: aws_sdk_autoscaling::Client::new(config),
        }
    }
}

fn to_activity(activity: &aws_sdk_autoscaling::types::Activity) -> ScalingActivity {
    ScalingActivity {
        start_time: activity.start_time().and_then(to_utc),
        progress: activity.progress().unwrap_or(0),
    }
}

impl AsgApi for AutoScalingGroup {
    fn members(&self) -> Result<Vec<AsgMember>, CloudError> {
        block_on(async {
            let mut members = Vec::new();
            let mut pages = self
                .client
                .describe_auto_scaling_groups()
                .auto_scaling_group_names(&self.name)
                .into_paginator()
                .send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| CloudError::api("describe auto scaling group", DisplayErrorContext(e)))?;
                for group in page.auto_scaling_groups() {
                    for instance in group.instances() {
                        members.push(AsgMember {
                            instance_id: instance.instance_id().unwrap_or_default().to_string(),
                            availability_zone: instance.availability_zone().unwrap_or_default().to_string(),
                            lifecycle_state: instance
                                .lifecycle_state()
                                .map(|s| s.as_str().to_string())
                                .unwrap_or_default(),
                        });
                    }
                }
            }

            Ok(members)
        })
    }

    fn detach(&self, ids: &[String], decrement_desired: bool) -> Result<Vec<ScalingActivity>, CloudError> {
        block_on(async {
            let resp = self
                .client
                .detach_instances()
                .auto_scaling_group_name(&self.name)
                .set_instance_ids(Some(ids.to_vec()))
                .should_decrement_desired_capacity(decrement_desired)
                .send()
                .await
                .map_err(|e| CloudError::api("detach instances from auto scaling group", DisplayErrorContext(e)))?;

            Ok(resp.activities().iter().map(to_activity).collect())
        })
    }

    fn activities(&self) -> Result<Vec<ScalingActivity>, CloudError> {
        block_on(async {
            let mut activities = Vec::new();
            let mut pages = self
                .client
                .describe_scaling_activities()
                .auto_scaling_group_name(&self.name)
                .into_paginator()
                .send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| CloudError::api("describe scaling activities", DisplayErrorContext(e)))?;
                activities.extend(page.activities().iter().map(to_activity));
            }

            Ok(activities)
        })
    }
}
