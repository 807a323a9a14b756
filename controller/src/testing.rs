//! In-memory stand-ins for the Kubernetes API used by the reconcile tests.

use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Mutex,
	},
};

use async_trait::async_trait;
use k8s_openapi::api::{
	apps::v1::{StatefulSet, StatefulSetStatus},
	core::v1::{ObjectReference, Service},
};
use kube::core::{ErrorResponse, ObjectMeta};
use serde_json::json;

use crate::{
	drift::Quantity,
	events::{EventRecorder, Severity},
	models::{MySql, MySqlSpec, MySqlStatus},
	prelude::*,
	status::{StatusComputer, StatusError},
	store::ClusterStore,
	utils::identity,
};

/// An error as returned by the API server.
pub fn api_error(code: u16, reason: &str) -> AppError {
	AppError::Kube(kube::Error::Api(ErrorResponse {
		status: "Failure".to_string(),
		message: reason.to_string(),
		reason: reason.to_string(),
		code,
	}))
}

/// A cluster as the user would submit it.
pub fn cluster(namespace: &str, name: &str, spec: serde_json::Value) -> MySql {
	let spec: MySqlSpec = serde_json::from_value(spec).unwrap();
	let mut cluster = MySql::new(name, spec);
	cluster.metadata.namespace = Some(namespace.to_string());
	cluster
}

/// A write issued against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
	ClusterStatus(String),
	CreateStatefulSet(String),
	UpdateStatefulSet(String),
	CreateService(String),
	UpdateService(String),
}

type Key = (String, String);

#[derive(Default)]
struct Objects {
	clusters: BTreeMap<Key, MySql>,
	stateful_sets: BTreeMap<Key, StatefulSet>,
	services: BTreeMap<Key, Service>,
	writes: Vec<Write>,
}

/// A store that behaves like the API server for the parts the controller
/// relies on: it assigns uids and resource versions, rejects stale writes
/// with a conflict, fills in defaulted fields and allocates service IPs.
#[derive(Default)]
pub struct FakeStore {
	objects: Mutex<Objects>,
	versions: AtomicU64,
}

fn key(metadata: &ObjectMeta) -> Result<Key, AppError> {
	let (namespace, name) = identity(metadata)?;
	Ok((namespace.to_string(), name.to_string()))
}

fn lookup(namespace: &str, name: &str) -> Key {
	(namespace.to_string(), name.to_string())
}

fn check_version(stored: &ObjectMeta, written: &ObjectMeta) -> Result<(), AppError> {
	match &written.resource_version {
		Some(version) if Some(version) != stored.resource_version.as_ref() => {
			Err(api_error(409, "Conflict"))
		}
		_ => Ok(()),
	}
}

impl FakeStore {
	fn next_version(&self) -> String {
		(self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string()
	}

	fn created(&self, metadata: &mut ObjectMeta) {
		metadata.uid = Some(format!("uid-{}", self.next_version()));
		metadata.resource_version = Some(self.next_version());
		metadata.generation = Some(1);
	}

	/// Stores a cluster as if a user had applied it.
	pub fn insert_cluster(&self, mut cluster: MySql) -> MySql {
		self.created(&mut cluster.metadata);
		let key = key(&cluster.metadata).unwrap();
		self.objects
			.lock()
			.unwrap()
			.clusters
			.insert(key, cluster.clone());
		cluster
	}

	/// Changes the spec of a stored cluster as if a user had edited it.
	pub fn edit_cluster(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut MySqlSpec)) {
		let version = self.next_version();
		let mut objects = self.objects.lock().unwrap();
		let cluster = objects.clusters.get_mut(&lookup(namespace, name)).unwrap();
		edit(&mut cluster.spec);
		cluster.metadata.resource_version = Some(version);
		cluster.metadata.generation = cluster.metadata.generation.map(|generation| generation + 1);
	}

	pub fn cluster(&self, namespace: &str, name: &str) -> Option<MySql> {
		self.objects
			.lock()
			.unwrap()
			.clusters
			.get(&lookup(namespace, name))
			.cloned()
	}

	pub fn stateful_set(&self, namespace: &str, name: &str) -> Option<StatefulSet> {
		self.objects
			.lock()
			.unwrap()
			.stateful_sets
			.get(&lookup(namespace, name))
			.cloned()
	}

	pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
		self.objects
			.lock()
			.unwrap()
			.services
			.get(&lookup(namespace, name))
			.cloned()
	}

	/// Reports `ready` of the desired replicas as ready, the way the
	/// StatefulSet controller would once it has rolled out the latest spec.
	pub fn set_ready_replicas(&self, namespace: &str, name: &str, ready: i32) {
		let version = self.next_version();
		let mut objects = self.objects.lock().unwrap();
		let stateful_set = objects
			.stateful_sets
			.get_mut(&lookup(namespace, name))
			.unwrap();
		let replicas = stateful_set
			.spec
			.as_ref()
			.and_then(|spec| spec.replicas)
			.unwrap_or(1);
		stateful_set.status = Some(StatefulSetStatus {
			observed_generation: stateful_set.metadata.generation,
			replicas,
			ready_replicas: Some(ready),
			current_replicas: Some(replicas),
			updated_replicas: Some(replicas),
			..StatefulSetStatus::default()
		});
		stateful_set.metadata.resource_version = Some(version);
	}

	/// Changes a stored StatefulSet as if someone else had edited it.
	pub fn tamper_stateful_set(
		&self,
		namespace: &str,
		name: &str,
		tamper: impl FnOnce(&mut StatefulSet),
	) {
		let version = self.next_version();
		let mut objects = self.objects.lock().unwrap();
		let stateful_set = objects
			.stateful_sets
			.get_mut(&lookup(namespace, name))
			.unwrap();
		tamper(stateful_set);
		stateful_set.metadata.resource_version = Some(version);
		stateful_set.metadata.generation = stateful_set
			.metadata
			.generation
			.map(|generation| generation + 1);
	}

	/// Deletes a stored Service as if a user had removed it.
	pub fn delete_service(&self, namespace: &str, name: &str) {
		self.objects
			.lock()
			.unwrap()
			.services
			.remove(&lookup(namespace, name));
	}

	pub fn writes(&self) -> Vec<Write> {
		self.objects.lock().unwrap().writes.clone()
	}

	pub fn clear_writes(&self) {
		self.objects.lock().unwrap().writes.clear();
	}
}

/// The form the API server stores a quantity in: the largest binary suffix
/// that keeps the number whole for binary quantities, otherwise the decimal
/// suffix with an exponent that is a multiple of 3.
pub fn canonical_quantity(quantity: &str) -> String {
	let Some(Quantity {
		negative,
		mantissa,
		exponent,
	}) = Quantity::parse(quantity)
	else {
		return quantity.to_string();
	};
	let sign = if negative { "-" } else { "" };

	if quantity.ends_with('i') && exponent >= 0 {
		let value = mantissa * 10u128.pow(exponent as u32);
		for (power, suffix) in [(6, "Ei"), (5, "Pi"), (4, "Ti"), (3, "Gi"), (2, "Mi"), (1, "Ki")] {
			let unit = 1024u128.pow(power);
			if value % unit == 0 {
				return format!("{}{}{}", sign, value / unit, suffix);
			}
		}
	}

	let power = exponent.div_euclid(3).clamp(-3, 6) * 3;
	let suffix = match power {
		-9 => "n",
		-6 => "u",
		-3 => "m",
		0 => "",
		3 => "k",
		6 => "M",
		9 => "G",
		12 => "T",
		15 => "P",
		_ => "E",
	};
	let value = mantissa * 10u128.pow((exponent - power).max(0) as u32);
	format!("{}{}{}", sign, value, suffix)
}

/// Rewrites the values of every `requests` and `limits` map into canonical
/// form.
fn canonicalize_quantities(value: &mut serde_json::Value, quantities: bool) {
	match value {
		serde_json::Value::Object(map) => {
			for (key, value) in map.iter_mut() {
				match value {
					serde_json::Value::String(quantity) if quantities => {
						*quantity = canonical_quantity(quantity);
					}
					value => {
					canonicalize_quantities(value, matches!(key.as_str(), "requests" | "limits"))
				}
				}
			}
		}
		serde_json::Value::Array(values) => {
			for value in values {
				canonicalize_quantities(value, false);
			}
		}
		_ => (),
	}
}

/// Fills in the fields the API server defaults on a StatefulSet.
fn with_stateful_set_defaults(stateful_set: &StatefulSet) -> StatefulSet {
	let mut stored = serde_json::to_value(stateful_set).unwrap();
	canonicalize_quantities(&mut stored, false);
	let spec = &mut stored["spec"];
	spec["revisionHistoryLimit"] = json!(10);
	spec["podManagementPolicy"] = json!("OrderedReady");
	spec["template"]["spec"]["restartPolicy"] = json!("Always");
	spec["template"]["spec"]["dnsPolicy"] = json!("ClusterFirst");
	spec["template"]["spec"]["terminationGracePeriodSeconds"] = json!(30);
	if let Some(containers) = spec["template"]["spec"]["containers"].as_array_mut() {
		for container in containers {
			container["terminationMessagePath"] = json!("/dev/termination-log");
			container["imagePullPolicy"] = json!("IfNotPresent");
		}
	}
	serde_json::from_value(stored).unwrap()
}

/// Fills in the fields the API server allocates on a Service.
fn with_service_allocations(service: &Service, index: u64) -> Service {
	let mut stored = service.clone();
	if let Some(spec) = &mut stored.spec {
		spec.session_affinity = Some("None".to_string());
		if spec.cluster_ip.is_none() {
			let ip = format!("10.96.0.{}", index % 250 + 2);
			spec.cluster_ip = Some(ip.clone());
			spec.cluster_ips = Some(vec![ip]);
		}
		if matches!(spec.type_.as_deref(), Some("NodePort" | "LoadBalancer")) {
			for (offset, port) in spec.ports.iter_mut().flatten().enumerate() {
				port.node_port.get_or_insert(30000 + offset as i32);
			}
		}
	}
	stored
}

#[async_trait]
impl ClusterStore for FakeStore {
	async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<MySql>, AppError> {
		Ok(self.cluster(namespace, name))
	}

	async fn update_cluster_status(&self, cluster: &MySql) -> Result<MySql, AppError> {
		let key = key(&cluster.metadata)?;
		let version = self.next_version();
		let mut objects = self.objects.lock().unwrap();
		let stored = objects
			.clusters
			.get_mut(&key)
			.ok_or_else(|| api_error(404, "NotFound"))?;
		check_version(&stored.metadata, &cluster.metadata)?;
		stored.status = cluster.status.clone();
		stored.metadata.resource_version = Some(version);
		let updated = stored.clone();
		objects.writes.push(Write::ClusterStatus(key.1));
		Ok(updated)
	}

	async fn get_stateful_set(
		&self,
		namespace: &str,
		name: &str,
	) -> Result<Option<StatefulSet>, AppError> {
		Ok(self.stateful_set(namespace, name))
	}

	async fn create_stateful_set(&self, stateful_set: &StatefulSet) -> Result<StatefulSet, AppError> {
		let key = key(&stateful_set.metadata)?;
		let mut stored = with_stateful_set_defaults(stateful_set);
		self.created(&mut stored.metadata);
		let mut objects = self.objects.lock().unwrap();
		if objects.stateful_sets.contains_key(&key) {
			return Err(api_error(409, "AlreadyExists"));
		}
		objects.stateful_sets.insert(key.clone(), stored.clone());
		objects.writes.push(Write::CreateStatefulSet(key.1));
		Ok(stored)
	}

	async fn update_stateful_set(&self, stateful_set: &StatefulSet) -> Result<StatefulSet, AppError> {
		let key = key(&stateful_set.metadata)?;
		let version = self.next_version();
		let mut objects = self.objects.lock().unwrap();
		let existing = objects
			.stateful_sets
			.get(&key)
			.ok_or_else(|| api_error(404, "NotFound"))?;
		check_version(&existing.metadata, &stateful_set.metadata)?;

		let mut stored = with_stateful_set_defaults(stateful_set);
		stored.metadata.uid = existing.metadata.uid.clone();
		stored.metadata.resource_version = Some(version);
		stored.metadata.generation = existing
			.metadata
			.generation
			.map(|generation| generation + 1);
		stored.status = existing.status.clone();
		objects.stateful_sets.insert(key.clone(), stored.clone());
		objects.writes.push(Write::UpdateStatefulSet(key.1));
		Ok(stored)
	}

	async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, AppError> {
		Ok(self.service(namespace, name))
	}

	async fn create_service(&self, service: &Service) -> Result<Service, AppError> {
		let key = key(&service.metadata)?;
		let version = self.versions.load(Ordering::SeqCst);
		let mut stored = with_service_allocations(service, version);
		self.created(&mut stored.metadata);
		let mut objects = self.objects.lock().unwrap();
		if objects.services.contains_key(&key) {
			return Err(api_error(409, "AlreadyExists"));
		}
		objects.services.insert(key.clone(), stored.clone());
		objects.writes.push(Write::CreateService(key.1));
		Ok(stored)
	}

	async fn update_service(&self, service: &Service) -> Result<Service, AppError> {
		let key = key(&service.metadata)?;
		let version = self.next_version();
		let mut objects = self.objects.lock().unwrap();
		let existing = objects
			.services
			.get(&key)
			.ok_or_else(|| api_error(404, "NotFound"))?;
		check_version(&existing.metadata, &service.metadata)?;
		let existing_ip = existing
			.spec
			.as_ref()
			.and_then(|spec| spec.cluster_ip.clone());
		if existing_ip !=
			service
				.spec
				.as_ref()
				.and_then(|spec| spec.cluster_ip.clone())
		{
			return Err(api_error(422, "Invalid"));
		}

		let mut stored = with_service_allocations(service, 0);
		stored.metadata.resource_version = Some(version);
		objects.services.insert(key.clone(), stored.clone());
		objects.writes.push(Write::UpdateService(key.1));
		Ok(stored)
	}
}

/// An event captured by [`RecordingEvents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
	pub target: String,
	pub severity: Severity,
	pub reason: String,
	pub message: String,
}

/// An event sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingEvents {
	events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
	pub fn events(&self) -> Vec<RecordedEvent> {
		self.events.lock().unwrap().clone()
	}

	/// The reasons of all recorded events, in order.
	pub fn reasons(&self) -> Vec<String> {
		self.events()
			.into_iter()
			.map(|event| event.reason)
			.collect()
	}
}

#[async_trait]
impl EventRecorder for RecordingEvents {
	async fn record(
		&self,
		target: &ObjectReference,
		severity: Severity,
		reason: &str,
		message: &str,
	) -> Result<(), AppError> {
		self.events.lock().unwrap().push(RecordedEvent {
			target: target.name.clone().unwrap_or_default(),
			severity,
			reason: reason.to_string(),
			message: message.to_string(),
		});
		Ok(())
	}
}

/// An event sink that is always unavailable.
pub struct FailingEvents;

#[async_trait]
impl EventRecorder for FailingEvents {
	async fn record(
		&self,
		_: &ObjectReference,
		_: Severity,
		_: &str,
		_: &str,
	) -> Result<(), AppError> {
		Err(api_error(503, "ServiceUnavailable"))
	}
}

/// A status computer that rejects every StatefulSet.
pub struct FailingStatus;

impl StatusComputer for FailingStatus {
	fn compute(
		&self,
		_: &MySql,
		observed: &StatefulSet,
	) -> Result<Option<MySqlStatus>, StatusError> {
		Err(StatusError::MissingSpec(
			observed.metadata.name.clone().unwrap_or_default(),
		))
	}
}

/// A store that never answers.
pub struct StalledStore;

#[async_trait]
impl ClusterStore for StalledStore {
	async fn get_cluster(&self, _: &str, _: &str) -> Result<Option<MySql>, AppError> {
		std::future::pending().await
	}

	async fn update_cluster_status(&self, _: &MySql) -> Result<MySql, AppError> {
		std::future::pending().await
	}

	async fn get_stateful_set(&self, _: &str, _: &str) -> Result<Option<StatefulSet>, AppError> {
		std::future::pending().await
	}

	async fn create_stateful_set(&self, _: &StatefulSet) -> Result<StatefulSet, AppError> {
		std::future::pending().await
	}

	async fn update_stateful_set(&self, _: &StatefulSet) -> Result<StatefulSet, AppError> {
		std::future::pending().await
	}

	async fn get_service(&self, _: &str, _: &str) -> Result<Option<Service>, AppError> {
		std::future::pending().await
	}

	async fn create_service(&self, _: &Service) -> Result<Service, AppError> {
		std::future::pending().await
	}

	async fn update_service(&self, _: &Service) -> Result<Service, AppError> {
		std::future::pending().await
	}
}

mod tests {
	use super::*;

	#[test]
	fn quantities_are_stored_in_canonical_form() {
		assert_eq!(canonical_quantity("1024Mi"), "1Gi");
		assert_eq!(canonical_quantity("1.5Gi"), "1536Mi");
		assert_eq!(canonical_quantity("0.5"), "500m");
		assert_eq!(canonical_quantity("2000"), "2k");
		assert_eq!(canonical_quantity("1000m"), "1");
		assert_eq!(canonical_quantity("10Gi"), "10Gi");
		assert_eq!(canonical_quantity("0"), "0");
	}
}
