use std::{fmt::Debug, future::Future};

use kube::{core::ObjectMeta, error::ErrorResponse, Api, Error};
use serde::de::DeserializeOwned;

use crate::prelude::*;

/// Extension methods on [`Api`] for objects the controller may or may not
/// have created yet.
pub trait KubeApiExt<K>
where
	K: Clone + DeserializeOwned + Debug,
{
	/// Gets the object with the given name, mapping a 404 to `None` so that a
	/// missing object is never treated as an error.
	fn get_existing(&self, name: &str) -> impl Future<Output = Result<Option<K>, Error>> + Send;
}

impl<K> KubeApiExt<K> for Api<K>
where
	K: Clone + DeserializeOwned + Debug + Send + Sync,
{
	async fn get_existing(&self, name: &str) -> Result<Option<K>, Error> {
		match self.get(name).await {
			Ok(obj) => Ok(Some(obj)),
			Err(Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
			Err(err) => Err(err),
		}
	}
}

/// The namespace and name of an object the controller is about to write.
pub fn identity(metadata: &ObjectMeta) -> Result<(&str, &str), AppError> {
	let namespace = metadata.namespace.as_deref().ok_or_else(|| {
		AppError::InternalError(format!(
			"object `{}` does not have a namespace",
			metadata.name.as_deref().unwrap_or_default()
		))
	})?;
	let name = metadata
		.name
		.as_deref()
		.ok_or_else(|| AppError::InternalError("object does not have a name".to_string()))?;
	Ok((namespace, name))
}
