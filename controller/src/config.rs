use std::{
	fmt::{Display, Formatter},
	time::Duration,
};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// The configuration for the controller. Keys are snake case since the
/// config sources lowercase them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
	/// The environment the application is running in. This is set at runtime
	/// based on an environment variable and if the application is compiled with
	/// debug mode.
	pub environment: RunningEnvironment,
	/// The name the controller reports events and writes objects as.
	#[serde(default = "default_controller_name")]
	pub controller_name: String,
	/// The instance of the controller reporting events, usually the pod name.
	#[serde(default)]
	pub instance: Option<String>,
	/// Only watch clusters in this namespace. All namespaces are watched when
	/// unset.
	#[serde(default)]
	pub watch_namespace: Option<String>,
	/// Deadline of a single reconcile, in seconds.
	#[serde(default = "default_reconcile_timeout_secs")]
	pub reconcile_timeout_secs: u64,
	/// How long to wait before retrying a reconcile that failed with a
	/// retryable error, in seconds.
	#[serde(default = "default_error_requeue_secs")]
	pub error_requeue_secs: u64,
	/// How often every cluster is reconciled even without changes, in seconds.
	#[serde(default = "default_resync_interval_secs")]
	pub resync_interval_secs: u64,
}

fn default_controller_name() -> String {
	"database-controller".to_string()
}

fn default_reconcile_timeout_secs() -> u64 {
	30
}

fn default_error_requeue_secs() -> u64 {
	5
}

fn default_resync_interval_secs() -> u64 {
	3600
}

impl Default for ControllerSettings {
	fn default() -> Self {
		Self {
			environment: RunningEnvironment::Development,
			controller_name: default_controller_name(),
			instance: None,
			watch_namespace: None,
			reconcile_timeout_secs: default_reconcile_timeout_secs(),
			error_requeue_secs: default_error_requeue_secs(),
			resync_interval_secs: default_resync_interval_secs(),
		}
	}
}

impl ControllerSettings {
	/// Get the controller settings from the config files and the environment.
	pub fn parse() -> Result<Self, ConfigError> {
		let env = if cfg!(debug_assertions) {
			"dev".to_string()
		} else {
			std::env::var("CONTROLLER_ENV").unwrap_or_else(|_| "prod".into())
		};

		match env.as_ref() {
			"prod" | "production" => Config::builder()
				.add_source(File::with_name("config/prod").required(false))
				.set_default("environment", "production")?,
			"dev" | "development" => Config::builder()
				.add_source(File::with_name("config/dev").required(false))
				.set_default("environment", "development")?,
			unknown => {
				return Err(ConfigError::Message(format!(
					"unknown running environment `{}`",
					unknown
				)));
			}
		}
		.add_source(
			Environment::with_prefix("CONTROLLER")
				.prefix_separator("_")
				.separator("__"),
		)
		.build()?
		.try_deserialize()
	}

	pub fn reconcile_timeout(&self) -> Duration {
		Duration::from_secs(self.reconcile_timeout_secs)
	}

	pub fn error_requeue(&self) -> Duration {
		Duration::from_secs(self.error_requeue_secs)
	}

	pub fn resync_interval(&self) -> Duration {
		Duration::from_secs(self.resync_interval_secs)
	}
}

/// The environment the application is running in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunningEnvironment {
	/// The application is running in development mode
	Development,
	/// The application is running in production mode
	Production,
}

impl Display for RunningEnvironment {
	fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
		write!(
			formatter,
			"{}",
			match self {
				RunningEnvironment::Development => "Development",
				RunningEnvironment::Production => "Production",
			}
		)
	}
}
