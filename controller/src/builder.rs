use std::collections::BTreeMap;

use k8s_openapi::{
	api::{
		apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy},
		core::v1::{
			Container,
			ContainerPort,
			EmptyDirVolumeSource,
			EnvVar,
			EnvVarSource,
			PersistentVolumeClaim,
			PersistentVolumeClaimSpec,
			PodSpec,
			PodTemplateSpec,
			Probe,
			ResourceRequirements,
			SecretKeySelector,
			Service,
			ServicePort,
			ServiceSpec,
			TCPSocketAction,
			Volume,
			VolumeMount,
			VolumeResourceRequirements,
		},
	},
	apimachinery::pkg::{
		api::resource::Quantity,
		apis::meta::v1::LabelSelector,
		util::intstr::IntOrString,
	},
};
use kube::core::ObjectMeta;

use crate::models::{MySql, MySqlSpec, ServiceType, Topology};

/// The name of the volume holding the data directory.
const DATA_VOLUME: &str = "data";
/// Where mysqld keeps its data directory.
const DATA_DIR: &str = "/var/lib/mysql";
/// Group replication needs at least 3 members to tolerate a failure, and
/// supports at most 9.
const GROUP_REPLICATION_MEMBERS: std::ops::RangeInclusive<i32> = 3..=9;

/// The children of a cluster as they should exist in the store.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredChildren {
	pub stateful_set: StatefulSet,
	pub service: Option<Service>,
}

/// A spec that cannot be turned into children. Retrying does not help until
/// the spec itself changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
	#[error("the cluster has no name")]
	MissingName,
	#[error("the cluster has no namespace")]
	MissingNamespace,
	#[error("the image must not be empty")]
	EmptyImage,
	#[error("replicas must be at least 1, got {0}")]
	InvalidReplicas(i32),
	#[error("a standalone cluster runs exactly 1 replica, got {0}")]
	StandaloneReplicas(i32),
	#[error("group replication needs between 3 and 9 replicas, got {0}")]
	GroupReplicationMembers(i32),
	#[error("port {0} is outside of 1-65535")]
	InvalidPort(i32),
	#[error("the storage size must not be empty")]
	EmptyStorageSize,
	#[error("invalid mysqld option `{0}`")]
	InvalidConfigKey(String),
}

/// Computes the desired children of a cluster. Implementations must be
/// deterministic and free of I/O.
pub trait ClusterBuilder: Send + Sync {
	fn build(&self, cluster: &MySql) -> Result<DesiredChildren, BuildError>;
}

/// Builds a StatefulSet running mysqld and the Service in front of it.
pub struct MySqlBuilder;

impl ClusterBuilder for MySqlBuilder {
	fn build(&self, cluster: &MySql) -> Result<DesiredChildren, BuildError> {
		let name = cluster
			.metadata
			.name
			.as_deref()
			.ok_or(BuildError::MissingName)?;
		let namespace = cluster
			.metadata
			.namespace
			.as_deref()
			.ok_or(BuildError::MissingNamespace)?;
		let spec = &cluster.spec;

		validate(spec)?;

		let labels = labels(name);

		Ok(DesiredChildren {
			stateful_set: stateful_set(name, namespace, spec, &labels),
			service: service(name, namespace, spec, &labels),
		})
	}
}

fn validate(spec: &MySqlSpec) -> Result<(), BuildError> {
	if spec.image.trim().is_empty() {
		return Err(BuildError::EmptyImage);
	}
	if spec.replicas < 1 {
		return Err(BuildError::InvalidReplicas(spec.replicas));
	}
	match spec.topology {
		Topology::Standalone if spec.replicas != 1 => {
			return Err(BuildError::StandaloneReplicas(spec.replicas));
		}
		Topology::GroupReplication if !GROUP_REPLICATION_MEMBERS.contains(&spec.replicas) => {
			return Err(BuildError::GroupReplicationMembers(spec.replicas));
		}
		_ => (),
	}
	validate_port(spec.port)?;
	if let Some(port) = spec.service.as_ref().and_then(|service| service.port) {
		validate_port(port)?;
	}
	if spec
		.storage
		.as_ref()
		.is_some_and(|storage| storage.size.trim().is_empty())
	{
		return Err(BuildError::EmptyStorageSize);
	}
	if let Some(key) = spec.config.keys().find(|key| {
		key.is_empty() ||
			key.starts_with('-') ||
			key.contains('=') ||
			key.contains(char::is_whitespace)
	}) {
		return Err(BuildError::InvalidConfigKey(key.clone()));
	}
	Ok(())
}

fn validate_port(port: i32) -> Result<(), BuildError> {
	if (1..=65535).contains(&port) {
		Ok(())
	} else {
		Err(BuildError::InvalidPort(port))
	}
}

fn labels(name: &str) -> BTreeMap<String, String> {
	[
		("app.kubernetes.io/name", "mysql"),
		("app.kubernetes.io/instance", name),
		("app.kubernetes.io/managed-by", "database-controller"),
	]
	.into_iter()
	.map(|(key, value)| (key.to_string(), value.to_string()))
	.collect()
}

fn stateful_set(
	name: &str,
	namespace: &str,
	spec: &MySqlSpec,
	labels: &BTreeMap<String, String>,
) -> StatefulSet {
	let env = match &spec.root_password_secret {
		Some(secret) => EnvVar {
			name: "MYSQL_ROOT_PASSWORD".to_string(),
			value_from: Some(EnvVarSource {
				secret_key_ref: Some(SecretKeySelector {
					name: Some(secret.name.clone()),
					key: secret.key.clone(),
					..SecretKeySelector::default()
				}),
				..EnvVarSource::default()
			}),
			..EnvVar::default()
		},
		None => EnvVar {
			name: "MYSQL_RANDOM_ROOT_PASSWORD".to_string(),
			value: Some("yes".to_string()),
			..EnvVar::default()
		},
	};

	let resources = spec.resources.as_ref().map(|resources| {
		let quantities = [("cpu", &resources.cpu), ("memory", &resources.memory)]
			.into_iter()
			.filter_map(|(resource, quantity)| {
				quantity
					.as_ref()
					.map(|quantity| (resource.to_string(), Quantity(quantity.clone())))
			})
			.collect::<BTreeMap<_, _>>();
		ResourceRequirements {
			limits: Some(quantities.clone()),
			requests: Some(quantities),
			claims: None,
		}
	});

	let (volumes, volume_claim_templates) = match &spec.storage {
		Some(storage) => (
			None,
			Some(vec![PersistentVolumeClaim {
				metadata: ObjectMeta {
					name: Some(DATA_VOLUME.to_string()),
					..ObjectMeta::default()
				},
				spec: Some(PersistentVolumeClaimSpec {
					access_modes: Some(vec!["ReadWriteOnce".to_string()]),
					resources: Some(VolumeResourceRequirements {
						requests: Some(
							[("storage".to_string(), Quantity(storage.size.clone()))].into(),
						),
						..VolumeResourceRequirements::default()
					}),
					storage_class_name: storage.storage_class_name.clone(),
					..PersistentVolumeClaimSpec::default()
				}),
				..PersistentVolumeClaim::default()
			}]),
		),
		None => (
			Some(vec![Volume {
				name: DATA_VOLUME.to_string(),
				empty_dir: Some(EmptyDirVolumeSource::default()),
				..Volume::default()
			}]),
			None,
		),
	};

	StatefulSet {
		metadata: ObjectMeta {
			name: Some(name.to_string()),
			namespace: Some(namespace.to_string()),
			labels: Some(labels.clone()),
			..ObjectMeta::default()
		},
		spec: Some(StatefulSetSpec {
			replicas: Some(spec.replicas),
			selector: LabelSelector {
				match_expressions: None,
				match_labels: Some(labels.clone()),
			},
			service_name: name.to_string(),
			template: PodTemplateSpec {
				metadata: Some(ObjectMeta {
					labels: Some(labels.clone()),
					..ObjectMeta::default()
				}),
				spec: Some(PodSpec {
					containers: vec![Container {
						name: "mysql".to_string(),
						image: Some(spec.image.clone()),
						args: mysqld_args(spec),
						ports: Some(vec![ContainerPort {
							name: Some("mysql".to_string()),
							container_port: spec.port,
							..ContainerPort::default()
						}]),
						env: Some(vec![env]),
						readiness_probe: Some(Probe {
							tcp_socket: Some(TCPSocketAction {
								port: IntOrString::Int(spec.port),
								host: None,
							}),
							initial_delay_seconds: Some(10),
							period_seconds: Some(10),
							..Probe::default()
						}),
						resources,
						volume_mounts: Some(vec![VolumeMount {
							name: DATA_VOLUME.to_string(),
							mount_path: DATA_DIR.to_string(),
							..VolumeMount::default()
						}]),
						..Container::default()
					}],
					volumes,
					..PodSpec::default()
				}),
			},
			update_strategy: Some(StatefulSetUpdateStrategy {
				type_: Some("RollingUpdate".to_owned()),
				..StatefulSetUpdateStrategy::default()
			}),
			volume_claim_templates,
			..StatefulSetSpec::default()
		}),
		..StatefulSet::default()
	}
}

/// mysqld arguments. The port always comes first, followed by the
/// replication settings and the user's options in key order.
fn mysqld_args(spec: &MySqlSpec) -> Option<Vec<String>> {
	let replication = match spec.topology {
		Topology::Standalone => &[][..],
		Topology::GroupReplication => &[
			"--gtid-mode=ON",
			"--enforce-gtid-consistency=ON",
			"--binlog-checksum=NONE",
		][..],
	};

	Some(
		std::iter::once(format!("--port={}", spec.port))
			.chain(replication.iter().map(|arg| arg.to_string()))
			.chain(
				spec.config
					.iter()
					.map(|(key, value)| format!("--{}={}", key, value)),
			)
			.collect(),
	)
}

/// The access service requested by the spec. A group replication cluster
/// without one still gets a headless service for peer discovery.
fn service(
	name: &str,
	namespace: &str,
	spec: &MySqlSpec,
	labels: &BTreeMap<String, String>,
) -> Option<Service> {
	let (type_, port, headless) = match (&spec.service, spec.topology) {
		(Some(access), _) => (access.type_, access.port.unwrap_or(spec.port), false),
		(None, Topology::GroupReplication) => (ServiceType::ClusterIP, spec.port, true),
		(None, Topology::Standalone) => return None,
	};

	Some(Service {
		metadata: ObjectMeta {
			name: Some(name.to_string()),
			namespace: Some(namespace.to_string()),
			labels: Some(labels.clone()),
			..ObjectMeta::default()
		},
		spec: Some(ServiceSpec {
			type_: Some(type_.as_str().to_string()),
			cluster_ip: headless.then(|| "None".to_string()),
			publish_not_ready_addresses: Some(headless),
			ports: Some(vec![ServicePort {
				name: Some("mysql".to_string()),
				port,
				target_port: Some(IntOrString::Int(spec.port)),
				protocol: Some("TCP".to_string()),
				..ServicePort::default()
			}]),
			selector: Some(labels.clone()),
			..ServiceSpec::default()
		}),
		..Service::default()
	})
}
