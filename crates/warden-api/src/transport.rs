//! HTTP request and response bodies
//!
//! Requests are form-encoded. The keys `resource`, `host`, `user` and
//! `instance` are reserved; every other key is a lease property. Responses
//! are JSON.

use serde::{Deserialize, Serialize};

use crate::{ApiError, ApiResult, Instance, Lease, LeaseSet, Properties, Snapshot, Subject};

/// Form key for the requested resource
pub const FORM_RESOURCE: &str = "resource";
/// Form key for the consumer's host
pub const FORM_HOST: &str = "host";
/// Form key for the consumer's user
pub const FORM_USER: &str = "user";
/// Form key for the instance ID
pub const FORM_INSTANCE: &str = "instance";

/// A lease request for acquire, release and lease listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequest {
    #[serde(flatten)]
    pub subject: Subject,
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,
}

impl LeaseRequest {
    pub fn new(subject: Subject, properties: Properties) -> Self {
        Self {
            subject,
            properties,
        }
    }

    pub fn resource(&self) -> &str {
        &self.subject.resource
    }

    pub fn instance(&self) -> &Instance {
        &self.subject.instance
    }

    /// Build a request from decoded form pairs. Unknown keys become properties.
    pub fn from_form<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut req = Self::default();
        for (key, value) in pairs {
            let key = key.into();
            let value = value.into();
            match key.as_str() {
                FORM_RESOURCE => req.subject.resource = value,
                FORM_HOST => req.subject.instance.host = value,
                FORM_USER => req.subject.instance.user = value,
                FORM_INSTANCE => req.subject.instance.id = value.into(),
                _ => {
                    req.properties.insert(key, value);
                }
            }
        }
        req
    }

    /// Encode the request as form pairs. Empty reserved fields are omitted.
    pub fn to_form(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(self.properties.len() + 4);
        let reserved = [
            (FORM_RESOURCE, self.subject.resource.as_str()),
            (FORM_HOST, self.subject.instance.host.as_str()),
            (FORM_USER, self.subject.instance.user.as_str()),
            (FORM_INSTANCE, self.subject.instance.id.as_str()),
        ];
        for (key, value) in reserved {
            if !value.is_empty() {
                pairs.push((key.to_string(), value.to_string()));
            }
        }
        for (key, value) in &self.properties {
            if !is_reserved(key) {
                pairs.push((key.clone(), value.clone()));
            }
        }
        pairs
    }

    /// Acquire and release require a consumer (host and user)
    pub fn require_consumer(&self) -> ApiResult<()> {
        let instance = &self.subject.instance;
        if instance.host.is_empty() || instance.user.is_empty() {
            return Err(ApiError::MissingConsumer);
        }
        Ok(())
    }
}

fn is_reserved(key: &str) -> bool {
    matches!(key, FORM_RESOURCE | FORM_HOST | FORM_USER | FORM_INSTANCE)
}

/// Response to `GET /health`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
}

/// Response to `POST /acquire`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub request: LeaseRequest,
    pub lease: Lease,
    pub leases: LeaseSet,
}

/// Response to `POST /release`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub request: LeaseRequest,
    pub success: bool,
}

/// Response to `GET /leases`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeasesResponse {
    pub request: LeaseRequest,
    /// Leases of every returned snapshot, in snapshot order
    pub leases: LeaseSet,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
}

impl LeasesResponse {
    pub fn new(request: LeaseRequest, snapshots: Vec<Snapshot>) -> Self {
        let leases = LeaseSet::from_iter_unsorted(
            snapshots.iter().flat_map(|s| s.leases.iter().cloned()),
        );
        Self {
            request,
            leases,
            snapshots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_keys_split_into_subject_and_properties() {
        let req = LeaseRequest::from_form([
            ("resource", "app"),
            ("host", "H1"),
            ("user", "U1"),
            ("instance", "I1"),
            ("program.name", "App.exe"),
        ]);

        assert_eq!(req.resource(), "app");
        assert_eq!(req.instance(), &Instance::new("H1", "U1", "I1"));
        assert_eq!(req.properties.len(), 1);
        assert_eq!(req.properties["program.name"], "App.exe");
    }

    #[test]
    fn to_form_round_trips_through_from_form() {
        let mut props = Properties::new();
        props.insert("program.name".into(), "app.exe".into());
        let req = LeaseRequest::new(Subject::new("", Instance::new("H1", "U1", "I1")), props);

        let pairs = req.to_form();
        assert!(pairs.iter().all(|(k, _)| k != "resource"));
        assert_eq!(LeaseRequest::from_form(pairs), req);
    }

    #[test]
    fn consumer_is_required() {
        let req = LeaseRequest::from_form([("host", "H1"), ("instance", "I1")]);
        assert_eq!(req.require_consumer(), Err(ApiError::MissingConsumer));
        assert_eq!(
            ApiError::MissingConsumer.to_string(),
            "consumer not specified or determinable"
        );

        let ok = LeaseRequest::from_form([("host", "H1"), ("user", "U1")]);
        assert!(ok.require_consumer().is_ok());
    }

    #[test]
    fn request_json_shape() {
        let req = LeaseRequest::from_form([("resource", "app"), ("host", "H1"), ("user", "U1")]);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["resource"], "app");
        assert_eq!(json["instance"]["user"], "U1");
        assert!(json.get("properties").is_none());
    }
}
