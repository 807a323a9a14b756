use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// MySQL cluster resource CRD spec. Everything needed to build the
/// StatefulSet and Service of the cluster is stored here.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
	kind = "MySQL",
	group = "database.operator.io",
	version = "v1",
	plural = "mysqls",
	shortname = "mysql",
	status = "MySqlStatus",
	namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MySqlSpec {
	/// The container image running mysqld.
	#[serde(default = "default_image")]
	pub image: String,
	/// The number of database instances.
	#[serde(default = "default_replicas")]
	pub replicas: i32,
	/// How the instances relate to each other.
	#[serde(default)]
	pub topology: Topology,
	/// The port mysqld listens on.
	#[serde(default = "default_port")]
	pub port: i32,
	/// The secret holding the root password. When absent, a random root
	/// password is generated by the image on first start.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub root_password_secret: Option<SecretKeyRef>,
	/// Persistent storage for the data directory. When absent, the data
	/// directory lives in an `emptyDir`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub storage: Option<StorageSpec>,
	/// Compute resources, applied as both requests and limits.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resources: Option<ResourceSpec>,
	/// The access service exposing the cluster.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub service: Option<AccessServiceSpec>,
	/// mysqld options, passed as `--key=value` arguments.
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub config: BTreeMap<String, String>,
}

/// The `MySQL` custom resource.
pub type MySql = MySQL;

fn default_image() -> String {
	"mysql:8.0".to_string()
}

fn default_replicas() -> i32 {
	1
}

fn default_port() -> i32 {
	3306
}

/// The replication topology of a cluster.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Topology {
	/// A single instance.
	#[default]
	Standalone,
	/// A MySQL group replication cluster of 3 to 9 members.
	GroupReplication,
}

/// A key inside a secret in the namespace of the cluster.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretKeyRef {
	pub name: String,
	pub key: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
	/// Size of the volume claim of every instance, e.g. `10Gi`.
	pub size: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub storage_class_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ResourceSpec {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cpu: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub memory: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct AccessServiceSpec {
	#[serde(default, rename = "type")]
	pub type_: ServiceType,
	/// The port exposed by the service. Defaults to the database port.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub port: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ServiceType {
	#[default]
	ClusterIP,
	NodePort,
	LoadBalancer,
}

impl ServiceType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::ClusterIP => "ClusterIP",
			Self::NodePort => "NodePort",
			Self::LoadBalancer => "LoadBalancer",
		}
	}
}

/// The observed state of a MySQL cluster. Only the latest value of every
/// condition is kept, history lives in the emitted events.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MySqlStatus {
	#[serde(default)]
	pub conditions: Vec<MySqlCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MySqlCondition {
	#[serde(rename = "type")]
	pub type_: ConditionType,
	pub status: ConditionStatus,
	#[serde(default)]
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_transition_time: Option<DateTime<Utc>>,
}

/// Condition types, in the order they are kept in the status.
#[derive(
	Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
pub enum ConditionType {
	Initialized,
	Ready,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
	True,
	False,
	#[default]
	Unknown,
}

impl From<bool> for ConditionStatus {
	fn from(value: bool) -> Self {
		if value {
			Self::True
		} else {
			Self::False
		}
	}
}

impl MySqlStatus {
	pub fn condition(&self, type_: ConditionType) -> Option<&MySqlCondition> {
		self.conditions
			.iter()
			.find(|condition| condition.type_ == type_)
	}

	pub fn is_true(&self, type_: ConditionType) -> bool {
		self.condition(type_)
			.is_some_and(|condition| condition.status == ConditionStatus::True)
	}

	/// Sets the condition of the given type, keeping the conditions
	/// deduplicated and ordered by type. The transition time only moves
	/// when the status value changes. Returns whether anything changed.
	pub fn set_condition(
		&mut self,
		type_: ConditionType,
		status: ConditionStatus,
		message: impl Into<String>,
		now: DateTime<Utc>,
	) -> bool {
		let message = message.into();
		match self
			.conditions
			.iter_mut()
			.find(|condition| condition.type_ == type_)
		{
			Some(condition) if condition.status != status => {
				condition.status = status;
				condition.message = message;
				condition.last_transition_time = Some(now);
				true
			}
			Some(condition) if condition.message != message => {
				condition.message = message;
				true
			}
			Some(_) => false,
			None => {
				let index = self
					.conditions
					.iter()
					.position(|condition| condition.type_ > type_)
					.unwrap_or(self.conditions.len());
				self.conditions.insert(
					index,
					MySqlCondition {
						type_,
						status,
						message,
						last_transition_time: Some(now),
					},
				);
				true
			}
		}
	}
}
