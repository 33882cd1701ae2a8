//! The metadata HTTP surface.
//!
//! Sits behind the hypervisor-local redirector, which injects the
//! identity headers on every guest request:
//!
//! - `X-Tenant-ID`: the hypervisor key.
//! - `X-Instance-ID`: the guest's domain UUID.
//! - `X-Forwarded-For`: the guest address (phone-home only).
//!
//! The root dispatches by first path segment: `/openstack/...` serves the
//! OpenStack layout, `/instancedata` is the phone-home callback, and
//! anything else is the EC2 layout. Version indices list their children
//! (`name/` for directories, `name` terminated by a newline for leaves)
//! and alias `latest` to the greatest registered version.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use ipd_core::record::PUB_KEY_PREFIX;

use crate::manager::{InstanceMetadata, MetadataError, MetadataManager};

/// EC2-compatible metadata API version.
pub const EC2_VERSION: &str = "2009-04-04";
/// OpenStack-compatible metadata API version.
pub const OPENSTACK_VERSION: &str = "2012-08-10";

/// A registered set of API versions with a `latest` alias.
pub struct ApiVersions {
    versions: BTreeMap<String, ()>,
}

impl ApiVersions {
    pub fn new(versions: &[&str]) -> Self {
        Self {
            versions: versions.iter().map(|v| (v.to_string(), ())).collect(),
        }
    }

    /// Index listing: every version plus the `latest` alias, sorted, one
    /// name per line.
    pub fn listing(&self) -> String {
        let mut children: Vec<&str> = self.versions.keys().map(String::as_str).collect();
        children.push("latest");
        children.sort_unstable();
        let mut out = String::new();
        for child in children {
            out.push_str(child);
            out.push('\n');
        }
        out
    }

    /// Resolve a path segment to a registered version; `latest` aliases
    /// the lexicographically greatest one.
    pub fn resolve(&self, segment: &str) -> Option<&str> {
        if segment == "latest" {
            self.versions.keys().next_back().map(String::as_str)
        } else {
            self.versions.get_key_value(segment).map(|(k, _)| k.as_str())
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<MetadataManager>,
    pub ec2: Arc<ApiVersions>,
    pub openstack: Arc<ApiVersions>,
}

impl AppState {
    pub fn new(manager: Arc<MetadataManager>) -> Self {
        Self {
            manager,
            ec2: Arc::new(ApiVersions::new(&[EC2_VERSION])),
            openstack: Arc::new(ApiVersions::new(&[OPENSTACK_VERSION])),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/instancedata", post(phone_home))
        .route("/instancedata/{uuid}", get(instance_record))
        .fallback(dispatch)
        .with_state(state)
}

/// The identity the redirector injected for a guest request.
struct Identity {
    hypervisor: String,
    uuid: Uuid,
}

fn identity_from_headers(headers: &HeaderMap) -> Result<Identity, Response> {
    let hypervisor = headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("missing X-Tenant-ID header"))?;
    let instance = headers
        .get("x-instance-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("missing X-Instance-ID header"))?;
    let uuid = Uuid::parse_str(instance)
        .map_err(|_| bad_request("X-Instance-ID is not a UUID"))?;
    Ok(Identity {
        hypervisor: hypervisor.to_string(),
        uuid,
    })
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let segments: Vec<&str> = uri.path().split('/').filter(|s| !s.is_empty()).collect();
    match segments.split_first() {
        None => state.ec2.listing().into_response(),
        Some((&"openstack", rest)) => match rest.split_first() {
            None => state.openstack.listing().into_response(),
            Some((version, rest)) => {
                if state.openstack.resolve(version).is_none() {
                    return not_found();
                }
                openstack_tree(&state, rest, &headers).await
            }
        },
        Some((version, rest)) => {
            if state.ec2.resolve(version).is_none() {
                return not_found();
            }
            ec2_tree(&state, rest, &headers).await
        }
    }
}

async fn ec2_tree(state: &AppState, rest: &[&str], headers: &HeaderMap) -> Response {
    match rest {
        [] => "meta-data/\nuser-data\n".into_response(),
        ["meta-data"] => "hostname\ninstance-id\npublic-keys/\n".into_response(),
        ["user-data"] => match userdata(state, headers).await {
            Ok(payload) => payload.into_response(),
            Err(resp) => resp,
        },
        ["meta-data", leaf @ ..] => {
            let metadata = match metadata(state, headers).await {
                Ok(metadata) => metadata,
                Err(resp) => return resp,
            };
            match leaf {
                ["hostname"] => metadata.hostname.into_response(),
                ["instance-id"] => metadata.uuid.to_string().into_response(),
                ["public-keys"] => {
                    let mut out = String::new();
                    for (i, (name, _)) in metadata.public_keys.iter().enumerate() {
                        out.push_str(&format!("{}={}\n", i, name));
                    }
                    out.into_response()
                }
                ["public-keys", index] => match key_at(&metadata, index) {
                    Some(_) => "openssh-key\n".into_response(),
                    None => not_found(),
                },
                ["public-keys", index, "openssh-key"] => match key_at(&metadata, index) {
                    Some(key) => key.to_string().into_response(),
                    None => not_found(),
                },
                _ => not_found(),
            }
        }
        _ => not_found(),
    }
}

async fn openstack_tree(state: &AppState, rest: &[&str], headers: &HeaderMap) -> Response {
    match rest {
        [] => "meta_data.json\nuser_data\n".into_response(),
        ["meta_data.json"] => {
            let metadata = match metadata(state, headers).await {
                Ok(metadata) => metadata,
                Err(resp) => return resp,
            };
            let public_keys: serde_json::Map<String, serde_json::Value> = metadata
                .public_keys
                .iter()
                .map(|(name, key)| (name.clone(), json!(key)))
                .collect();
            Json(json!({
                "uuid": metadata.uuid.to_string(),
                "name": metadata.name,
                "hostname": metadata.hostname,
                "public_keys": public_keys,
            }))
            .into_response()
        }
        ["user_data"] => match userdata(state, headers).await {
            Ok(payload) => payload.into_response(),
            Err(resp) => resp,
        },
        _ => not_found(),
    }
}

fn key_at<'a>(metadata: &'a InstanceMetadata, index: &str) -> Option<&'a str> {
    let index: usize = index.parse().ok()?;
    metadata.public_keys.get(index).map(|(_, key)| key.as_str())
}

async fn metadata(state: &AppState, headers: &HeaderMap) -> Result<InstanceMetadata, Response> {
    let identity = identity_from_headers(headers)?;
    state
        .manager
        .metadata_for(&identity.hypervisor, identity.uuid)
        .await
        .map_err(internal_error)
}

async fn userdata(state: &AppState, headers: &HeaderMap) -> Result<String, Response> {
    let identity = identity_from_headers(headers)?;
    state
        .manager
        .userdata_for(&identity.hypervisor, identity.uuid)
        .await
        .map_err(internal_error)
}

/// Phone-home callback. Required form fields: `instance_id`, `hostname`.
/// Unless `nosetip` is present, the guest address is taken from
/// `X-Forwarded-For`. Every `pub_key_*` field is stored verbatim
/// (trimmed). All fields land in one store write.
async fn phone_home(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<Vec<(String, String)>>,
) -> Response {
    let field = |name: &str| {
        form.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let Some(instance_id) = field("instance_id") else {
        return bad_request("missing instance_id");
    };
    let Some(hostname) = field("hostname") else {
        return bad_request("missing hostname");
    };

    let mut fields = vec![
        ("hostname".to_string(), hostname.to_string()),
        ("status".to_string(), "running".to_string()),
    ];

    if field("nosetip").is_none() {
        let ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim);
        let Some(ip) = ip else {
            return bad_request("missing X-Forwarded-For header");
        };
        fields.push(("ip_address".to_string(), ip.to_string()));
    }

    for (name, value) in &form {
        if name.starts_with(PUB_KEY_PREFIX) {
            fields.push((name.clone(), value.trim().to_string()));
        }
    }

    info!(instance = instance_id, hostname, "Guest phoned home");
    match state
        .manager
        .record_phone_home(instance_id, fields)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => internal_error(e),
    }
}

/// Operator endpoint: the raw rendezvous record for an instance.
async fn instance_record(State(state): State<AppState>, Path(uuid): Path<String>) -> Response {
    match state.manager.instancedata_for(&uuid).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => internal_error(e),
    }
}

fn bad_request(reason: &str) -> Response {
    (StatusCode::BAD_REQUEST, reason.to_string()).into_response()
}

fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn internal_error(e: MetadataError) -> Response {
    error!(error = %e, "Metadata request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "500: Internal server error".to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_listing_sorted_with_latest() {
        let versions = ApiVersions::new(&[EC2_VERSION]);
        assert_eq!(versions.listing(), "2009-04-04\nlatest\n");
    }

    #[test]
    fn test_latest_resolves_to_greatest_version() {
        let versions = ApiVersions::new(&["2009-04-04", "2011-01-01"]);
        assert_eq!(versions.resolve("latest"), Some("2011-01-01"));
        assert_eq!(versions.resolve("2009-04-04"), Some("2009-04-04"));
        assert_eq!(versions.resolve("2038-01-19"), None);
    }

    #[test]
    fn test_listing_with_multiple_versions() {
        let versions = ApiVersions::new(&["2011-01-01", "2009-04-04"]);
        assert_eq!(versions.listing(), "2009-04-04\n2011-01-01\nlatest\n");
    }
}
