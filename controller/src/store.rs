use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Service};
use kube::{api::PostParams, Api, Client};
#[cfg(test)]
use mockall::automock;

use crate::{models::MySql, prelude::*, utils::identity};

/// Read and write access to the clusters and the objects they own.
///
/// Objects that do not exist are returned as `None`. Every write carries the
/// `resourceVersion` of the object it replaces, so a concurrent modification
/// fails with a conflict instead of being overwritten.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
	/// Gets the cluster with the given name.
	async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<MySql>, AppError>;

	/// Replaces the status subresource of the cluster. The spec is never
	/// written through this path.
	async fn update_cluster_status(&self, cluster: &MySql) -> Result<MySql, AppError>;

	/// Gets the StatefulSet with the given name.
	async fn get_stateful_set(
		&self,
		namespace: &str,
		name: &str,
	) -> Result<Option<StatefulSet>, AppError>;

	/// Creates a StatefulSet in the namespace set on its metadata.
	async fn create_stateful_set(&self, stateful_set: &StatefulSet) -> Result<StatefulSet, AppError>;

	/// Replaces a StatefulSet. The `resourceVersion` it carries must match
	/// the stored one.
	async fn update_stateful_set(&self, stateful_set: &StatefulSet) -> Result<StatefulSet, AppError>;

	/// Gets the Service with the given name.
	async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, AppError>;

	/// Creates a Service in the namespace set on its metadata.
	async fn create_service(&self, service: &Service) -> Result<Service, AppError>;

	/// Replaces a Service. The `resourceVersion` it carries must match the
	/// stored one.
	async fn update_service(&self, service: &Service) -> Result<Service, AppError>;
}

/// A [`ClusterStore`] backed by the Kubernetes API.
pub struct KubeStore {
	client: Client,
	field_manager: String,
}

impl KubeStore {
	/// Creates a store that writes every object as `field_manager`.
	pub fn new(client: Client, field_manager: String) -> Self {
		Self {
			client,
			field_manager,
		}
	}

	fn post_params(&self) -> PostParams {
		PostParams {
			dry_run: false,
			field_manager: Some(self.field_manager.clone()),
		}
	}
}

#[async_trait]
impl ClusterStore for KubeStore {
	async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<MySql>, AppError> {
		Ok(Api::<MySql>::namespaced(self.client.clone(), namespace)
			.get_existing(name)
			.await?)
	}

	async fn update_cluster_status(&self, cluster: &MySql) -> Result<MySql, AppError> {
		let (namespace, name) = identity(&cluster.metadata)?;
		trace!("Replacing status of MySQL cluster {}/{}", namespace, name);
		Ok(Api::<MySql>::namespaced(self.client.clone(), namespace)
			.replace_status(name, &self.post_params(), serde_json::to_vec(cluster)?)
			.await?)
	}

	async fn get_stateful_set(
		&self,
		namespace: &str,
		name: &str,
	) -> Result<Option<StatefulSet>, AppError> {
		Ok(Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
			.get_existing(name)
			.await?)
	}

	async fn create_stateful_set(&self, stateful_set: &StatefulSet) -> Result<StatefulSet, AppError> {
		let (namespace, _) = identity(&stateful_set.metadata)?;
		Ok(Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
			.create(&self.post_params(), stateful_set)
			.await?)
	}

	async fn update_stateful_set(&self, stateful_set: &StatefulSet) -> Result<StatefulSet, AppError> {
		let (namespace, name) = identity(&stateful_set.metadata)?;
		Ok(Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
			.replace(name, &self.post_params(), stateful_set)
			.await?)
	}

	async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, AppError> {
		Ok(Api::<Service>::namespaced(self.client.clone(), namespace)
			.get_existing(name)
			.await?)
	}

	async fn create_service(&self, service: &Service) -> Result<Service, AppError> {
		let (namespace, _) = identity(&service.metadata)?;
		Ok(Api::<Service>::namespaced(self.client.clone(), namespace)
			.create(&self.post_params(), service)
			.await?)
	}

	async fn update_service(&self, service: &Service) -> Result<Service, AppError> {
		let (namespace, name) = identity(&service.metadata)?;
		Ok(Api::<Service>::namespaced(self.client.clone(), namespace)
			.replace(name, &self.post_params(), service)
			.await?)
	}
}
