use std::sync::Arc;

use kube::Client;

use crate::{
	builder::{ClusterBuilder, MySqlBuilder},
	config::ControllerSettings,
	events::{EventRecorder, KubeEventRecorder},
	status::{ReplicaStatusComputer, StatusComputer},
	store::{ClusterStore, KubeStore},
};

/// All state shared across every reconcile. The collaborators are injected
/// here so that the reconciler never reaches for a global handle.
pub struct AppState {
	/// Read and write access to the clusters and their children.
	pub store: Arc<dyn ClusterStore>,
	/// Where edge-triggered events are published.
	pub events: Arc<dyn EventRecorder>,
	/// Computes the desired children of a cluster.
	pub builder: Arc<dyn ClusterBuilder>,
	/// Computes the status of a cluster from its observed StatefulSet.
	pub status: Arc<dyn StatusComputer>,
	/// The settings the controller was started with.
	pub settings: ControllerSettings,
}

impl AppState {
	/// Creates the state backed by the given Kubernetes client.
	pub fn new(client: Client, settings: ControllerSettings) -> Self {
		Self {
			store: Arc::new(KubeStore::new(
				client.clone(),
				settings.controller_name.clone(),
			)),
			events: Arc::new(KubeEventRecorder::new(
				client,
				settings.controller_name.clone(),
				settings.instance.clone(),
			)),
			builder: Arc::new(MySqlBuilder),
			status: Arc::new(ReplicaStatusComputer),
			settings,
		}
	}

	/// Creates the state with the production builder and status computer
	/// on top of the given store and event recorder.
	#[cfg(test)]
	pub fn for_testing(store: Arc<dyn ClusterStore>, events: Arc<dyn EventRecorder>) -> Self {
		Self {
			store,
			events,
			builder: Arc::new(MySqlBuilder),
			status: Arc::new(ReplicaStatusComputer),
			settings: ControllerSettings::default(),
		}
	}
}

/// Errors that fail a reconcile and are handed to the error policy.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
	/// The Kubernetes API returned an error, including optimistic
	/// concurrency conflicts.
	#[error("kubernetes api error: {0}")]
	Kube(#[from] kube::Error),
	/// The reconcile deadline expired while waiting on the Kubernetes API.
	#[error("reconcile deadline exceeded while waiting for the kubernetes api")]
	DeadlineExceeded,
	/// An object could not be serialized for the API.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	/// An invariant of the controller was violated.
	#[error("internal error: {0}")]
	InternalError(String),
}

impl AppError {
	/// Whether retrying the same reconcile later can succeed without the
	/// cluster spec changing.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Kube(_) | Self::DeadlineExceeded => true,
			Self::Serialization(_) | Self::InternalError(_) => false,
		}
	}

	/// Whether this is an optimistic concurrency conflict.
	pub fn is_conflict(&self) -> bool {
		matches!(self, Self::Kube(kube::Error::Api(response)) if response.code == 409)
	}
}
