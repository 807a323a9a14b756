use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;

use crate::models::{ConditionStatus, ConditionType, MySql, MySqlStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
	#[error("StatefulSet `{0}` has no spec")]
	MissingSpec(String),
}

/// Computes the status of a cluster from its observed StatefulSet.
///
/// The result may only depend on the observed StatefulSet and the status
/// already persisted on the cluster, so computing it again, or out of order,
/// is always safe. `Ok(None)` means the persisted status is still accurate.
pub trait StatusComputer: Send + Sync {
	fn compute(
		&self,
		cluster: &MySql,
		observed: &StatefulSet,
	) -> Result<Option<MySqlStatus>, StatusError>;
}

/// Derives the conditions of a cluster from the replica counts of its
/// StatefulSet.
pub struct ReplicaStatusComputer;

impl StatusComputer for ReplicaStatusComputer {
	fn compute(
		&self,
		cluster: &MySql,
		observed: &StatefulSet,
	) -> Result<Option<MySqlStatus>, StatusError> {
		let spec = observed.spec.as_ref().ok_or_else(|| {
			StatusError::MissingSpec(observed.metadata.name.clone().unwrap_or_default())
		})?;
		let observed_status = observed.status.clone().unwrap_or_default();

		let desired = spec.replicas.unwrap_or(1);
		let ready = observed_status.ready_replicas.unwrap_or(0);
		let updated = observed_status.updated_replicas.unwrap_or(0);
		let generation_observed =
			match (observed.metadata.generation, observed_status.observed_generation) {
				(Some(generation), Some(observed_generation)) => observed_generation >= generation,
				(Some(_), None) => false,
				(None, _) => true,
			};

		let previous = cluster.status.clone().unwrap_or_default();
		let mut status = previous.clone();
		let now = Utc::now();

		let initialized = previous.is_true(ConditionType::Initialized) || ready > 0;
		let mut changed = status.set_condition(
			ConditionType::Initialized,
			initialized.into(),
			if initialized {
				"cluster initialized".to_string()
			} else {
				"waiting for the first replica to become ready".to_string()
			},
			now,
		);

		let (ready_status, message) = if !generation_observed {
			(
				ConditionStatus::False,
				"waiting for the StatefulSet controller to observe the latest spec".to_string(),
			)
		} else if updated < desired {
			(
				ConditionStatus::False,
				format!("{}/{} replicas updated", updated, desired),
			)
		} else if ready < desired {
			(
				ConditionStatus::False,
				format!("{}/{} replicas ready", ready, desired),
			)
		} else {
			(
				ConditionStatus::True,
				format!("{}/{} replicas ready", ready, desired),
			)
		};
		changed |= status.set_condition(ConditionType::Ready, ready_status, message, now);

		Ok(changed.then_some(status))
	}
}
