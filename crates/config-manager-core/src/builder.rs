//! Conversion of a service config document into proxy resources.
//!
//! The full listener/cluster/route translation lives behind the
//! [`ResourceBuilder`] trait. [`DocumentResourceBuilder`] is the default: it
//! wraps the document and the discovered platform attributes into typed
//! resources without interpreting the API surface.

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::management::ServiceConfigDocument;
use crate::metadata::GcpAttributes;
use crate::snapshot::{Resource, ResourceSet};

pub const SERVICE_CONFIG_TYPE_URL: &str = "type.googleapis.com/google.api.Service";
pub const GCP_ATTRIBUTES_TYPE_URL: &str =
    "type.googleapis.com/espv2.api.scpb.GcpAttributes";
pub const API_TYPE_URL: &str = "type.googleapis.com/google.protobuf.Api";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("service config {config_id} is not a JSON object")]
    NotAnObject { config_id: String },
    #[error("service config {config_id} has a malformed {field:?} field")]
    MalformedField {
        config_id: String,
        field: &'static str,
    },
    #[error("resource builder rejected service config: {0}")]
    Rejected(String),
}

/// Turns a document into the resource set published for proxies.
pub trait ResourceBuilder: Send + Sync {
    fn build(&self, document: &ServiceConfigDocument) -> Result<ResourceSet, BuildError>;
}

/// Default builder: one resource for the whole document, one per declared
/// API, and the platform attributes when known.
#[derive(Debug, Clone, Default)]
pub struct DocumentResourceBuilder {
    gcp_attributes: Option<GcpAttributes>,
}

impl DocumentResourceBuilder {
    pub fn new(gcp_attributes: Option<GcpAttributes>) -> Self {
        Self { gcp_attributes }
    }
}

impl ResourceBuilder for DocumentResourceBuilder {
    fn build(&self, document: &ServiceConfigDocument) -> Result<ResourceSet, BuildError> {
        let raw = document.raw();
        if !raw.is_object() {
            return Err(BuildError::NotAnObject {
                config_id: document.config_id.clone(),
            });
        }

        let mut resources = vec![Resource {
            type_url: SERVICE_CONFIG_TYPE_URL.to_string(),
            name: document.service_name.clone(),
            body: raw.clone(),
        }];

        match raw.get("apis") {
            None | Some(Value::Null) => {}
            Some(Value::Array(apis)) => {
                for api in apis {
                    let name = api.get("name").and_then(Value::as_str).ok_or_else(|| {
                        BuildError::MalformedField {
                            config_id: document.config_id.clone(),
                            field: "apis",
                        }
                    })?;
                    resources.push(Resource {
                        type_url: API_TYPE_URL.to_string(),
                        name: name.to_string(),
                        body: api.clone(),
                    });
                }
            }
            Some(_) => {
                return Err(BuildError::MalformedField {
                    config_id: document.config_id.clone(),
                    field: "apis",
                })
            }
        }

        if let Some(attributes) = &self.gcp_attributes {
            resources.push(Resource {
                type_url: GCP_ATTRIBUTES_TYPE_URL.to_string(),
                name: document.service_name.clone(),
                body: attributes_json(attributes),
            });
        }

        Ok(ResourceSet::new(resources))
    }
}

fn attributes_json(attributes: &GcpAttributes) -> Value {
    let mut map = Map::new();
    if let Some(project_id) = &attributes.project_id {
        map.insert("projectId".into(), json!(project_id));
    }
    if let Some(zone) = &attributes.zone {
        map.insert("zone".into(), json!(zone));
    }
    if let Some(platform) = attributes.platform {
        map.insert("platform".into(), json!(platform.to_string()));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Platform;

    fn document(raw: Value) -> ServiceConfigDocument {
        ServiceConfigDocument::new("svc.example.com".into(), "c1".into(), raw)
    }

    #[test]
    fn wraps_document_and_apis() {
        let set = DocumentResourceBuilder::default()
            .build(&document(json!({
                "name": "svc.example.com",
                "apis": [{"name": "Bookstore"}, {"name": "Shelves"}]
            })))
            .expect("resources");

        assert_eq!(set.len(), 3);
        assert_eq!(set.of_type(SERVICE_CONFIG_TYPE_URL).count(), 1);
        let apis: Vec<&str> = set.of_type(API_TYPE_URL).map(|r| r.name.as_str()).collect();
        assert_eq!(apis, vec!["Bookstore", "Shelves"]);
    }

    #[test]
    fn includes_platform_attributes() {
        let builder = DocumentResourceBuilder::new(Some(GcpAttributes {
            project_id: Some("proj".into()),
            zone: Some("us-east1-b".into()),
            platform: Some(Platform::Gke),
        }));
        let set = builder.build(&document(json!({}))).expect("resources");
        let attributes = set
            .of_type(GCP_ATTRIBUTES_TYPE_URL)
            .next()
            .expect("attributes resource");
        assert_eq!(
            attributes.body,
            json!({"projectId": "proj", "zone": "us-east1-b", "platform": "GKE"})
        );
    }

    #[test]
    fn rejects_malformed_apis() {
        let err = DocumentResourceBuilder::default()
            .build(&document(json!({"apis": {"name": "x"}})))
            .expect_err("apis must be a list");
        assert_eq!(
            err,
            BuildError::MalformedField {
                config_id: "c1".into(),
                field: "apis"
            }
        );

        let err = DocumentResourceBuilder::default()
            .build(&document(json!({"apis": [{"version": "v1"}]})))
            .expect_err("api without name");
        assert!(matches!(err, BuildError::MalformedField { .. }));
    }

    #[test]
    fn rejects_non_object_documents() {
        let err = DocumentResourceBuilder::default()
            .build(&document(json!("scalar")))
            .expect_err("scalar");
        assert!(matches!(err, BuildError::NotAnObject { .. }));
    }
}
