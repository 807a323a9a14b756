use std::{future::Future, sync::Arc};

use futures::{future, FutureExt, StreamExt};
use k8s_openapi::{
	api::{apps::v1::StatefulSet, core::v1::{ObjectReference, Service}},
	NamespaceResourceScope,
};
use kube::{
	runtime::{
		controller::{Action, Controller},
		watcher,
	},
	Api,
	Client,
	Resource,
};
use tokio::{signal, time::Instant};

use crate::{
	drift::{configuration_drifted, headless_changed, merge_service},
	events::{reasons, transitions, Severity},
	models::MySql,
	prelude::*,
	utils::identity,
};

/// Starts the MySQL controller. This function will ideally run forever, only
/// exiting when a ctrl-c signal is received.
pub async fn start_controller(client: Client, state: Arc<AppState>) {
	let namespace = state.settings.watch_namespace.as_deref();
	match namespace {
		Some(namespace) => info!("Watching MySQL clusters in namespace `{}`", namespace),
		None => info!("Watching MySQL clusters in all namespaces"),
	}

	Controller::new(api::<MySql>(&client, namespace), watcher::Config::default())
		.owns(
			api::<StatefulSet>(&client, namespace),
			watcher::Config::default(),
		)
		.owns(api::<Service>(&client, namespace), watcher::Config::default())
		.graceful_shutdown_on(signal::ctrl_c().map(|_| ()))
		.run(reconcile, error_policy, state)
		.for_each(|result| {
			match result {
				Ok((cluster, _)) => trace!("Reconciled MySQL cluster {}", cluster),
				Err(err) => debug!("Reconcile did not complete: {}", err),
			}
			future::ready(())
		})
		.await;

	info!("MySQL controller stopped");
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
	K: Resource<Scope = NamespaceResourceScope>,
	K::DynamicType: Default,
{
	match namespace {
		Some(namespace) => Api::namespaced(client.clone(), namespace),
		None => Api::all(client.clone()),
	}
}

/// Decides when a failed reconcile is retried. Store errors are transient
/// and retried after the configured back-off, anything else waits for the
/// cluster or one of its children to change.
fn error_policy(cluster: Arc<MySql>, err: &AppError, ctx: Arc<AppState>) -> Action {
	let name = cluster.metadata.name.as_deref().unwrap_or_default();
	if err.is_retryable() {
		warn!(
			"Reconciling MySQL cluster `{}` failed, retrying: {}",
			name, err
		);
		Action::requeue(ctx.settings.error_requeue())
	} else {
		error!(
			"Reconciling MySQL cluster `{}` failed, waiting for a change: {}",
			name, err
		);
		Action::await_change()
	}
}

/// Reconciles a MySQL cluster delivered by the controller. The object handed
/// over is only used to find the cluster, the reconcile itself reads the
/// latest state from the store.
async fn reconcile(cluster: Arc<MySql>, ctx: Arc<AppState>) -> Result<Action, AppError> {
	let (namespace, name) = identity(&cluster.metadata)?;
	let deadline = Instant::now() + ctx.settings.reconcile_timeout();

	reconcile_cluster(&ctx, namespace, name, deadline).await?;

	Ok(Action::requeue(ctx.settings.resync_interval()))
}

/// Converges the children and the status of one MySQL cluster towards its
/// spec. Every pass recomputes the full desired state, so running it again
/// on an unchanged, converged cluster writes nothing.
#[instrument(skip(ctx, deadline))]
pub async fn reconcile_cluster(
	ctx: &AppState,
	namespace: &str,
	name: &str,
	deadline: Instant,
) -> Result<(), AppError> {
	let Some(cluster) = bounded(deadline, ctx.store.get_cluster(namespace, name)).await? else {
		debug!("MySQL cluster no longer exists, nothing to do");
		return Ok(());
	};
	let target = cluster.object_ref(&());

	let children = match ctx.builder.build(&cluster) {
		Ok(children) => children,
		Err(err) => {
			warn!("Cannot build the children of the MySQL cluster: {}", err);
			record(
				ctx,
				deadline,
				&target,
				Severity::Warning,
				reasons::STATEFUL_SET_BUILD_FAILED,
				&err.to_string(),
			)
			.await;
			return Ok(());
		}
	};
	let owner_reference = cluster.controller_owner_ref(&()).ok_or_else(|| {
		AppError::InternalError(format!(
			"MySQL cluster `{}/{}` does not have a uid",
			namespace, name
		))
	})?;

	if let Some(mut service) = children.service {
		service.metadata.owner_references = Some(vec![owner_reference.clone()]);
		reconcile_service(ctx, deadline, &target, service).await?;
	}

	let mut stateful_set = children.stateful_set;
	stateful_set.metadata.owner_references = Some(vec![owner_reference]);
	let (_, stateful_set_name) = identity(&stateful_set.metadata)?;

	let Some(observed) = bounded(
		deadline,
		ctx.store.get_stateful_set(namespace, stateful_set_name),
	)
	.await?
	else {
		info!("Creating StatefulSet `{}`", stateful_set_name);
		bounded(deadline, ctx.store.create_stateful_set(&stateful_set)).await?;
		record(
			ctx,
			deadline,
			&target,
			Severity::Normal,
			reasons::STATEFUL_SET_CREATED,
			&format!("created StatefulSet {}", stateful_set_name),
		)
		.await;
		return Ok(());
	};

	let status_written = sync_status(ctx, deadline, &cluster, &target, &observed).await;
	if let Err(err) = &status_written {
		warn!("Failed to persist the status of the MySQL cluster: {}", err);
	}

	if configuration_drifted(&stateful_set, &observed)? {
		info!("StatefulSet `{}` drifted, updating it", stateful_set_name);
		stateful_set.metadata.resource_version = observed.metadata.resource_version.clone();
		bounded(deadline, ctx.store.update_stateful_set(&stateful_set)).await?;
	} else {
		trace!("StatefulSet `{}` is up to date", stateful_set_name);
	}

	status_written
}

/// Creates or updates the Service of a cluster. A Service that would have to
/// switch between headless and an allocated cluster IP cannot be updated in
/// place. It is left alone with a Warning event until it is deleted, so the
/// remaining steps of the reconcile still run.
async fn reconcile_service(
	ctx: &AppState,
	deadline: Instant,
	target: &ObjectReference,
	service: Service,
) -> Result<(), AppError> {
	let (namespace, name) = identity(&service.metadata)?;

	match bounded(deadline, ctx.store.get_service(namespace, name)).await? {
		None => {
			info!("Creating Service `{}`", name);
			bounded(deadline, ctx.store.create_service(&service)).await?;
		}
		Some(observed) if headless_changed(&service, &observed) => {
			warn!(
				"Service `{}` cannot switch between headless and a cluster IP in place",
				name
			);
			record(
				ctx,
				deadline,
				target,
				Severity::Warning,
				reasons::SERVICE_RECREATE_REQUIRED,
				&format!(
					"Service {} must be deleted to switch between headless and a cluster IP, it is recreated afterwards",
					name
				),
			)
			.await;
		}
		Some(observed) if configuration_drifted(&service, &observed)? => {
			info!("Service `{}` drifted, updating it", name);
			bounded(
				deadline,
				ctx.store.update_service(&merge_service(&service, &observed)),
			)
			.await?;
		}
		Some(_) => trace!("Service `{}` is up to date", name),
	}

	Ok(())
}

/// Persists the status computed from the observed StatefulSet and publishes
/// an event for every condition that changed its value. Nothing is written
/// when the persisted status is still accurate.
async fn sync_status(
	ctx: &AppState,
	deadline: Instant,
	cluster: &MySql,
	target: &ObjectReference,
	observed: &StatefulSet,
) -> Result<(), AppError> {
	let status = match ctx.status.compute(cluster, observed) {
		Ok(Some(status)) => status,
		Ok(None) => {
			trace!("Status of the MySQL cluster is unchanged");
			return Ok(());
		}
		Err(err) => {
			error!("Cannot compute the status of the MySQL cluster: {}", err);
			return Ok(());
		}
	};

	let previous = cluster.status.clone().unwrap_or_default();
	let mut updated = cluster.clone();
	updated.status = Some(status.clone());
	bounded(deadline, ctx.store.update_cluster_status(&updated)).await?;
	debug!("Updated the status of the MySQL cluster");

	for transition in transitions(&previous, &status) {
		record(
			ctx,
			deadline,
			target,
			transition.severity,
			transition.reason,
			&transition.message,
		)
		.await;
	}

	Ok(())
}

/// Runs a store or event call, failing with [`AppError::DeadlineExceeded`]
/// once the deadline of the reconcile has passed.
async fn bounded<T>(
	deadline: Instant,
	call: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
	tokio::time::timeout_at(deadline, call)
		.await
		.map_err(|_| AppError::DeadlineExceeded)?
}

/// Publishes an event. A lost event never fails the reconcile.
async fn record(
	ctx: &AppState,
	deadline: Instant,
	target: &ObjectReference,
	severity: Severity,
	reason: &str,
	message: &str,
) {
	match bounded(
		deadline,
		ctx.events.record(target, severity, reason, message),
	)
	.await
	{
		Ok(()) => trace!("Recorded {} event", reason),
		Err(err) => warn!("Failed to record {} event: {}", reason, err),
	}
}
