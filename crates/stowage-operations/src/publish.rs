//! Publish protocol operations.
//!
//! Each function takes the parameters an HTTP route hands in, drives the storage engine and
//! reports exactly one outcome. Engine errors are forwarded untouched, with one exception:
//! internal failures while creating a package are logged and reported as bad package data.

use serde::de::DeserializeOwned;
use serde_json::Value;
use stowage_core::{
    document::{PackageManifest, VersionMetadata},
    error::StoreError,
    storage::PackageStorage,
    StoreResult,
};
use stowage_utils::string::decode_uri;
use tokio::io::AsyncRead;
use tracing::{debug, error};

use crate::types::{
    Outcome, BAD_PACKAGE_DATA, PACKAGE_CHANGED, PACKAGE_CREATED, PACKAGE_PUBLISHED,
    PACKAGE_REMOVED, STAR_NOT_IMPLEMENTED, TARBALL_REMOVED, TARBALL_UPLOADED,
};

/// Publishes `version` of `name` and points `tag` at it.
pub async fn add_version<S>(
    storage: &S,
    name: &str,
    version: &str,
    body: Value,
    tag: &str,
) -> StoreResult<Outcome>
where
    S: PackageStorage + ?Sized,
{
    let name = decode_uri(name);
    let metadata: VersionMetadata = decode_body(body)?;

    storage.add_version(&name, version, metadata, tag).await?;
    debug!(package = %name, version, tag, "version published");
    Ok(Outcome::created(PACKAGE_PUBLISHED))
}

/// Streams `inbound` into a new attachment of `name`.
///
/// The outcome is reported only once the engine has committed or aborted the upload; an
/// inbound read error aborts it.
pub async fn upload_package_tarball<S, R>(
    storage: &S,
    name: &str,
    filename: &str,
    inbound: R,
) -> StoreResult<Outcome>
where
    S: PackageStorage + ?Sized,
    R: AsyncRead + Unpin + Send,
{
    let name = decode_uri(name);
    let filename = decode_uri(filename);

    let mut stream = storage.add_tarball(&name, &filename).await?;
    stream.pipe_from(inbound).await?;
    let tarball = stream.done().await?;

    debug!(package = %name, filename = %filename, size = tarball.size, "tarball uploaded");
    Ok(Outcome::created(TARBALL_UPLOADED))
}

pub async fn remove_tarball<S>(
    storage: &S,
    name: &str,
    filename: &str,
    revision: &str,
) -> StoreResult<Outcome>
where
    S: PackageStorage + ?Sized,
{
    let name = decode_uri(name);
    let filename = decode_uri(filename);

    storage.remove_tarball(&name, &filename, revision).await?;
    Ok(Outcome::created(TARBALL_REMOVED))
}

pub async fn un_publish_package<S>(storage: &S, name: &str) -> StoreResult<Outcome>
where
    S: PackageStorage + ?Sized,
{
    let name = decode_uri(name);

    storage.remove_package(&name).await?;
    debug!(package = %name, "package unpublished");
    Ok(Outcome::created(PACKAGE_REMOVED))
}

/// Creates a package, or updates it when the route carries a revision.
///
/// Star and un-star requests (a body with `users`) are rejected without touching storage.
pub async fn publish_package<S>(
    storage: &S,
    name: &str,
    body: Value,
    route_revision: Option<&str>,
) -> StoreResult<Outcome>
where
    S: PackageStorage + ?Sized,
{
    let name = decode_uri(name);

    if let Some(revision) = route_revision {
        let manifest: PackageManifest = decode_body(body)?;
        storage.change_package(&name, manifest, revision).await?;
        debug!(package = %name, "package changed");
        return Ok(Outcome::created(PACKAGE_CHANGED));
    }

    if body.get("users").is_some() {
        return Err(StoreError::UnsupportedOperation(
            STAR_NOT_IMPLEMENTED.to_string(),
        ));
    }

    create_package(storage, &name, body).await
}

async fn create_package<S>(storage: &S, name: &str, body: Value) -> StoreResult<Outcome>
where
    S: PackageStorage + ?Sized,
{
    let created = match serde_json::from_value::<PackageManifest>(body) {
        Ok(manifest) => storage.add_package(name, manifest).await,
        Err(err) => Err(StoreError::Json(err)),
    };

    match created {
        Ok(doc) => {
            debug!(package = name, rev = %doc.rev, "package created");
            Ok(Outcome::created(PACKAGE_CREATED))
        }
        Err(err) if err.is_internal() => {
            error!(package = name, "failed to create package: {err:?}");
            Err(StoreError::BadPackageData(BAD_PACKAGE_DATA.to_string()))
        }
        Err(err) => Err(err),
    }
}

fn decode_body<T: DeserializeOwned>(body: Value) -> StoreResult<T> {
    serde_json::from_value(body)
        .map_err(|err| StoreError::BadPackageData(format!("invalid package metadata: {err}")))
}
