use std::collections::BTreeMap;

use aws_sdk_ecs::types::{ContainerInstanceStatus, Failure, Resource};
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_types::SdkConfig;

use crate::cloud::{
    CloudError, ContainerInstance, DESCRIBE_BATCH, EcsApi, EcsService, EcsTask, ServiceEvent, ServiceLoadBalancer,
    container_instance_id, service_id,
};
use crate::cloud::aws::to_utc;
use crate::runtime::block_on;

pub struct EcsCluster {
    cluster: String,
    client: aws_sdk_ecs::Client,
}

impl EcsCluster {
    pub fn new(config: &SdkConfig, cluster: &str) -> Self {
        EcsCluster {
            cluster: cluster.to_string(),
            client: aws_sdk_ecs::Client::new(config),
        }
    }
}

/// ECS batch describes report per-resource errors in a `failures` list
/// alongside the successful descriptions. Any failure is fatal here.
fn check_failures(failures: &[Failure]) -> Result<(), CloudError> {
    match failures.first() {
        None => Ok(()),
        Some(failure) => Err(CloudError::Scheduler {
            arn: failure.arn().unwrap_or_default().to_string(),
            reason: failure.reason().unwrap_or_default().to_string(),
        }),
    }
}

fn resource_value(resources: &[Resource], name: &str) -> i64 {
    resources
        .iter()
        .find(|r| r.name() == Some(name))
        .map(|r| r.integer_value() as i64)
        .unwrap_or(0)
}

impl EcsApi for EcsCluster {
    fn list_hosts(&self) -> Result<Vec<String>, CloudError> {
        block_on(async {
            let mut ids = Vec::new();
            let mut pages = self
                .client
                .list_container_instances()
                .cluster(&self.cluster)
                .into_paginator()
                .send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| CloudError::api("list container instances", DisplayErrorContext(e)))?;
                ids.extend(page.container_instance_arns().iter().map(|arn| container_instance_id(arn).to_string()));
            }

            Ok(ids)
        })
    }

    fn describe_hosts(&self, ids: &[String]) -> Result<BTreeMap<String, ContainerInstance>, CloudError> {
        block_on(async {
            let mut hosts = BTreeMap::new();
            for batch in ids.chunks(DESCRIBE_BATCH) {
                let resp = self
                    .client
                    .describe_container_instances()
                    .cluster(&self.cluster)
                    .set_container_instances(Some(batch.to_vec()))
                    .send()
                    .await
                    .map_err(|e| CloudError::api("describe container instances", DisplayErrorContext(e)))?;
                check_failures(resp.failures())?;

                for instance in resp.container_instances() {
                    let id = container_instance_id(instance.container_instance_arn().unwrap_or_default()).to_string();
                    hosts.insert(
                        id.clone(),
                        ContainerInstance {
                            id,
                            ec2_instance_id: instance.ec2_instance_id().unwrap_or_default().to_string(),
                            status: instance.status().unwrap_or_default().to_string(),
                            registered_cpu: resource_value(instance.registered_resources(), "CPU"),
                            remaining_cpu: resource_value(instance.remaining_resources(), "CPU"),
                            registered_memory: resource_value(instance.registered_resources(), "MEMORY"),
                            remaining_memory: resource_value(instance.remaining_resources(), "MEMORY"),
                        },
                    );
                }
            }

            Ok(hosts)
        })
    }

    fn list_services(&self) -> Result<Vec<String>, CloudError> {
        block_on(async {
            let mut ids = Vec::new();
            let mut pages = self.client.list_services().cluster(&self.cluster).into_paginator().send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| CloudError::api("list services", DisplayErrorContext(e)))?;
                ids.extend(page.service_arns().iter().map(|arn| service_id(arn).to_string()));
            }

            Ok(ids)
        })
    }

    fn describe_services(&self, ids: &[String]) -> Result<BTreeMap<String, EcsService>, CloudError> {
        block_on(async {
            let mut services = BTreeMap::new();
            for batch in ids.chunks(DESCRIBE_BATCH) {
                let resp = self
                    .client
                    .describe_services()
                    .cluster(&self.cluster)
                    .set_services(Some(batch.to_vec()))
                    .send()
                    .await
                    .map_err(|e| CloudError::api("describe services", DisplayErrorContext(e)))?;
                check_failures(resp.failures())?;

                for service in resp.services() {
                    let id = service_id(service.service_arn().unwrap_or_default()).to_string();
                    services.insert(
                        id.clone(),
                        EcsService {
                            id,
                            task_definition: service.task_definition().unwrap_or_default().to_string(),
                            desired_count: service.desired_count() as i64,
                            status: service.status().unwrap_or_default().to_string(),
                            load_balancers: service
                                .load_balancers()
                                .iter()
                                .map(|lb| ServiceLoadBalancer {
                                    load_balancer_name: lb.load_balancer_name().map(str::to_string),
                                    target_group_arn: lb.target_group_arn().map(str::to_string),
                                })
                                .collect(),
                            events: service
                                .events()
                                .iter()
                                .filter_map(|event| {
                                    Some(ServiceEvent {
                                        created_at: event.created_at().and_then(to_utc)?,
                                        message: event.message().unwrap_or_default().to_string(),
                                    })
                                })
                                .collect(),
                        },
                    );
                }
            }

            Ok(services)
        })
    }

    fn list_tasks(&self) -> Result<Vec<String>, CloudError> {
        block_on(async {
            let mut arns = Vec::new();
            let mut pages = self.client.list_tasks().cluster(&self.cluster).into_paginator().send();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| CloudError::api("list tasks", DisplayErrorContext(e)))?;
                arns.extend(page.task_arns().iter().cloned());
            }

            Ok(arns)
        })
    }

    fn describe_tasks(&self, arns: &[String]) -> Result<BTreeMap<String, EcsTask>, CloudError> {
        block_on(async {
            let mut tasks = BTreeMap::new();
            for batch in arns.chunks(DESCRIBE_BATCH) {
                let resp = self
                    .client
                    .describe_tasks()
                    .cluster(&self.cluster)
                    .set_tasks(Some(batch.to_vec()))
                    .send()
                    .await
                    .map_err(|e| CloudError::api("describe tasks", DisplayErrorContext(e)))?;
                check_failures(resp.failures())?;

                for task in resp.tasks() {
                    let arn = task.task_arn().unwrap_or_default().to_string();
                    tasks.insert(
                        arn.clone(),
                        EcsTask {
                            arn,
                            task_definition: task.task_definition_arn().unwrap_or_default().to_string(),
                            container_instance_id: task
                                .container_instance_arn()
                                .map(|arn| container_instance_id(arn).to_string()),
                        },
                    );
                }
            }

            Ok(tasks)
        })
    }

    fn deregister_host(&self, id: &str) -> Result<(), CloudError> {
        block_on(async {
            // force so the tasks become orphaned and get rescheduled across
            // the cluster
            self.client
                .deregister_container_instance()
                .cluster(&self.cluster)
                .container_instance(id)
                .force(true)
                .send()
                .await
                .map_err(|e| CloudError::api("deregister container instance", DisplayErrorContext(e)))?;
            Ok(())
        })
    }

    fn list_active_instance_ids(&self) -> Result<Vec<String>, CloudError> {
        let ids = block_on(async {
            let mut ids = Vec::new();
            let mut pages = self
                .client
                .list_container_instances()
                .cluster(&self.cluster)
                .status(ContainerInstanceStatus::Active)
                .into_paginator()
                .send();

            while let Some(page) = pages.next().await {
                let page =
                    page.map_err(|e| CloudError::api("list active container instances", DisplayErrorContext(e)))?;
                ids.extend(page.container_instance_arns().iter().map(|arn| container_instance_id(arn).to_string()));
            }

            Ok::<_, CloudError>(ids)
        })?;

        let hosts = self.describe_hosts(&ids)?;
        Ok(hosts.into_values().map(|h| h.ec2_instance_id).collect())
    }
}
