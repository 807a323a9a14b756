#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! A Kubernetes controller that runs MySQL clusters. Every `MySQL` resource
//! is turned into a StatefulSet running the database instances and, when
//! requested, a Service exposing them. The controller keeps both in sync with
//! the resource and reports the health of the cluster through its status
//! conditions and events.

use std::sync::Arc;

use kube::{Client, CustomResourceExt};
use tracing::{Dispatch, Level};
use tracing_subscriber::{
	filter::LevelFilter,
	fmt::{format::FmtSpan, Layer as FmtLayer},
	layer::SubscriberExt,
	prelude::*,
};

use crate::{
	app::AppState,
	config::{ControllerSettings, RunningEnvironment},
	models::MySql,
};

/// A prelude that re-exports commonly used items.
pub mod prelude {
	pub use tracing::{debug, error, info, instrument, trace, warn};

	pub use crate::{
		app::{AppError, AppState},
		utils::KubeApiExt,
	};
}

/// All app state that is shared across the entire application.
mod app;
/// Builds the StatefulSet and Service of a cluster from its spec.
mod builder;
/// The configuration of the controller.
mod config;
/// Compares desired and observed children.
mod drift;
/// Events published on clusters.
mod events;
/// All models used by the controller, including CRDs, etc.
mod models;
/// The controller that keeps MySQL clusters in sync with their spec.
mod mysql;
/// Derives the status conditions of a cluster.
mod status;
/// Access to the clusters and their children.
mod store;
/// In-memory stand-ins used by the tests.
#[cfg(test)]
mod testing;
/// Utility functions used by the controller.
mod utils;

#[tokio::main]
async fn main() {
	if std::env::args().nth(1).as_deref() == Some("crd") {
		print!(
			"{}",
			serde_yaml::to_string(&MySql::crd()).expect("Failed to serialize the CRD")
		);
		return;
	}

	let settings = ControllerSettings::parse().expect("Failed to parse controller settings");

	tracing::dispatcher::set_global_default(Dispatch::new(
		tracing_subscriber::registry().with(
			FmtLayer::new()
				.with_span_events(FmtSpan::NONE)
				.event_format(
					tracing_subscriber::fmt::format()
						.with_ansi(true)
						.with_file(false)
						.without_time()
						.compact(),
				)
				.with_filter(
					tracing_subscriber::filter::Targets::new()
						.with_target(env!("CARGO_CRATE_NAME"), LevelFilter::TRACE)
						.with_target("kube_runtime", LevelFilter::INFO),
				)
				.with_filter(LevelFilter::from_level(
					if settings.environment == RunningEnvironment::Development {
						Level::TRACE
					} else {
						Level::DEBUG
					},
				)),
		),
	))
	.expect("Failed to set global default subscriber");

	tracing::info!(
		"Starting {} in {} mode",
		settings.controller_name,
		settings.environment
	);

	let client = Client::try_default()
		.await
		.expect("Failed to get kubernetes client details");

	let state = Arc::new(AppState::new(client.clone(), settings));

	mysql::start_controller(client, state).await;
}
