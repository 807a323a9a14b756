use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
	runtime::events::{Event, EventType, Recorder, Reporter},
	Client,
};

use crate::{
	models::{ConditionType, MySqlStatus},
	prelude::*,
};

/// Reasons of the events published on a cluster.
pub mod reasons {
	pub const STATEFUL_SET_BUILD_FAILED: &str = "StatefulSetBuildFailed";
	pub const STATEFUL_SET_CREATED: &str = "StatefulSetCreated";
	pub const SERVICE_RECREATE_REQUIRED: &str = "ServiceRecreateRequired";
	pub const CLUSTER_INITIALIZED: &str = "ClusterInitialized";
	pub const CLUSTER_READY: &str = "ClusterReady";
	pub const CLUSTER_NOT_READY: &str = "ClusterNotReady";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
	Normal,
	Warning,
}

impl From<Severity> for EventType {
	fn from(severity: Severity) -> Self {
		match severity {
			Severity::Normal => EventType::Normal,
			Severity::Warning => EventType::Warning,
		}
	}
}

/// An append-only sink of events about an object.
#[async_trait]
pub trait EventRecorder: Send + Sync {
	async fn record(
		&self,
		target: &ObjectReference,
		severity: Severity,
		reason: &str,
		message: &str,
	) -> Result<(), AppError>;
}

/// Publishes events to the Kubernetes events API.
pub struct KubeEventRecorder {
	client: Client,
	reporter: Reporter,
}

impl KubeEventRecorder {
	/// Creates a recorder that reports events as `controller`, optionally
	/// naming the `instance` of the controller that published them.
	pub fn new(client: Client, controller: String, instance: Option<String>) -> Self {
		Self {
			client,
			reporter: Reporter {
				controller,
				instance,
			},
		}
	}
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
	async fn record(
		&self,
		target: &ObjectReference,
		severity: Severity,
		reason: &str,
		message: &str,
	) -> Result<(), AppError> {
		Recorder::new(self.client.clone(), self.reporter.clone(), target.clone())
			.publish(Event {
				type_: severity.into(),
				reason: reason.to_string(),
				note: Some(message.to_string()),
				action: "Reconciling".to_string(),
				secondary: None,
			})
			.await?;
		Ok(())
	}
}

/// An event caused by a condition changing its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
	pub severity: Severity,
	pub reason: &'static str,
	pub message: String,
}

/// The events to publish when the status of a cluster moves from `previous`
/// to `current`. Only changes of a condition's value produce an event, so a
/// cluster that stays in the same state publishes nothing.
pub fn transitions(previous: &MySqlStatus, current: &MySqlStatus) -> Vec<Transition> {
	let mut transitions = Vec::new();

	if !previous.is_true(ConditionType::Initialized) &&
		current.is_true(ConditionType::Initialized)
	{
		transitions.push(Transition {
			severity: Severity::Normal,
			reason: reasons::CLUSTER_INITIALIZED,
			message: "cluster initialized".to_string(),
		});
	}

	match (
		previous.is_true(ConditionType::Ready),
		current.is_true(ConditionType::Ready),
	) {
		(false, true) => transitions.push(Transition {
			severity: Severity::Normal,
			reason: reasons::CLUSTER_READY,
			message: "cluster is ready".to_string(),
		}),
		(true, false) => {
			if let Some(condition) = current.condition(ConditionType::Ready) {
				transitions.push(Transition {
					severity: Severity::Warning,
					reason: reasons::CLUSTER_NOT_READY,
					message: condition.message.clone(),
				});
			}
		}
		_ => (),
	}

	transitions
}
