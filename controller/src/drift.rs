//! Detects drift between the desired and the observed configuration of a
//! child object.
//!
//! The store fills in defaults and bookkeeping (uid, resourceVersion,
//! managedFields, status, defaulted pod fields, allocated IPs) that the
//! desired definition never sets. An observed object is therefore in sync
//! when every field set in the desired object has the same value in the
//! observed one. Lists must match element by element, so an entry added
//! to a list the controller owns is still drift.

use k8s_openapi::api::core::v1::Service;
use serde::Serialize;
use serde_json::Value;

/// Whether the observed object differs from the desired one in any field the
/// desired object sets. Resource quantities are compared by value, since the
/// store keeps them in canonical form (`1024Mi` is stored as `1Gi`).
pub fn configuration_drifted<K>(desired: &K, observed: &K) -> Result<bool, serde_json::Error>
where
	K: Serialize,
{
	Ok(!is_subset(
		&serde_json::to_value(desired)?,
		&serde_json::to_value(observed)?,
		false,
	))
}

/// `quantities` is set when both values are `requests` or `limits` maps.
fn is_subset(desired: &Value, observed: &Value, quantities: bool) -> bool {
	match (desired, observed) {
		(Value::Null, _) => true,
		(Value::Object(desired), Value::Object(observed)) => {
			desired
				.iter()
				.all(|(key, desired)| match observed.get(key) {
					Some(observed) if quantities => same_quantity(desired, observed),
					Some(observed) => is_subset(desired, observed, is_quantity_map(key)),
					None => is_empty(desired),
				})
		}
		(Value::Object(desired), Value::Null) => desired.values().all(is_empty),
		(Value::Array(desired), Value::Array(observed)) => {
			desired.len() == observed.len() &&
				desired
					.iter()
					.zip(observed)
					.all(|(desired, observed)| is_subset(desired, observed, false))
		}
		(Value::Array(desired), Value::Null) => desired.is_empty(),
		(desired, observed) => desired == observed,
	}
}

fn same_quantity(desired: &Value, observed: &Value) -> bool {
	match (desired, observed) {
		(Value::String(desired), Value::String(observed)) => {
			desired == observed ||
				matches!(
					(Quantity::parse(desired), Quantity::parse(observed)),
					(Some(desired), Some(observed)) if desired == observed
				)
		}
		(desired, observed) => desired == observed,
	}
}

fn is_quantity_map(key: &str) -> bool {
	matches!(key, "requests" | "limits")
}

fn is_empty(value: &Value) -> bool {
	match value {
		Value::Null => true,
		Value::Array(values) => values.is_empty(),
		Value::Object(values) => values.values().all(is_empty),
		_ => false,
	}
}

/// The exact value of a resource quantity, `mantissa * 10^exponent`, with
/// the trailing zeros of the mantissa moved into the exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity {
	pub negative: bool,
	pub mantissa: u128,
	pub exponent: i32,
}

impl Quantity {
	/// Parses a quantity such as `500m`, `1.5Gi` or `1e3`. Returns `None` for
	/// anything that is not a quantity or does not fit.
	pub fn parse(quantity: &str) -> Option<Self> {
		let (negative, unsigned) = match quantity.as_bytes().first()? {
			b'-' => (true, &quantity[1..]),
			b'+' => (false, &quantity[1..]),
			_ => (false, quantity),
		};
		let number_end = unsigned
			.find(|c: char| !c.is_ascii_digit() && c != '.')
			.unwrap_or(unsigned.len());
		let (number, suffix) = unsigned.split_at(number_end);
		let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
		if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
			return None;
		}

		let mut mantissa = 0u128;
		for digit in whole.bytes().chain(fraction.bytes()) {
			mantissa = mantissa
				.checked_mul(10)?
				.checked_add(u128::from(digit - b'0'))?;
		}
		let mut exponent = -i32::try_from(fraction.len()).ok()?;

		let (binary_power, decimal_power) = match suffix {
			"" => (0, 0),
			"n" => (0, -9),
			"u" => (0, -6),
			"m" => (0, -3),
			"k" => (0, 3),
			"M" => (0, 6),
			"G" => (0, 9),
			"T" => (0, 12),
			"P" => (0, 15),
			"E" => (0, 18),
			"Ki" => (1, 0),
			"Mi" => (2, 0),
			"Gi" => (3, 0),
			"Ti" => (4, 0),
			"Pi" => (5, 0),
			"Ei" => (6, 0),
			exponential => {
				let power = exponential
					.strip_prefix('e')
					.or_else(|| exponential.strip_prefix('E'))?;
				(0, power.parse::<i32>().ok()?)
			}
		};
		mantissa = mantissa.checked_mul(1024u128.checked_pow(binary_power)?)?;
		exponent = exponent.checked_add(decimal_power)?;

		if mantissa == 0 {
			return Some(Self {
				negative: false,
				mantissa: 0,
				exponent: 0,
			});
		}
		while mantissa % 10 == 0 {
			mantissa /= 10;
			exponent += 1;
		}
		Some(Self {
			negative,
			mantissa,
			exponent,
		})
	}
}

/// Whether the desired and the observed service disagree on being headless.
/// The cluster IP of a service cannot change once allocated, so such a
/// service can only be replaced by deleting it.
pub fn headless_changed(desired: &Service, observed: &Service) -> bool {
	fn headless(service: &Service) -> bool {
		service
			.spec
			.as_ref()
			.and_then(|spec| spec.cluster_ip.as_deref()) ==
			Some("None")
	}
	headless(desired) != headless(observed)
}

/// The observed service with its spec replaced by the desired one. The
/// cluster IPs allocated by the store are immutable and are carried over, as
/// are node ports while the service still exposes them.
pub fn merge_service(desired: &Service, observed: &Service) -> Service {
	let mut merged = observed.clone();
	if let Some(labels) = &desired.metadata.labels {
		merged
			.metadata
			.labels
			.get_or_insert_with(Default::default)
			.extend(labels.clone());
	}
	merged.metadata.owner_references = desired.metadata.owner_references.clone();

	let mut spec = desired.spec.clone().unwrap_or_default();
	if let Some(observed_spec) = &observed.spec {
		if spec.cluster_ip.is_none() {
			spec.cluster_ip = observed_spec.cluster_ip.clone();
			spec.cluster_ips = observed_spec.cluster_ips.clone();
		}
		let exposes_node_ports = matches!(spec.type_.as_deref(), Some("NodePort" | "LoadBalancer"));
		if let (true, Some(ports), Some(observed_ports)) =
			(exposes_node_ports, &mut spec.ports, &observed_spec.ports)
		{
			for port in ports.iter_mut().filter(|port| port.node_port.is_none()) {
				port.node_port = observed_ports
					.iter()
					.find(|observed| observed.name == port.name && observed.port == port.port)
					.and_then(|observed| observed.node_port);
			}
		}
	}
	merged.spec = Some(spec);
	merged
}
