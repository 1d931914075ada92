//! Remote resource classification and listing payloads.

use crate::reconcile::{Listing, RemoteError, RemoteListing};
use crate::tree::NodeKind;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What a remote resource is, derived from its class tag.
///
/// The set is closed: a tag this build does not know maps to `Unknown`,
/// and unknown resources are skipped rather than guessed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    ResourceGroup,
    VectorLayer,
    PostgisLayer,
    RasterLayer,
    Style,
    Unknown,
}

impl ResourceKind {
    /// Map a service class tag to a kind.
    pub fn classify(cls: &str) -> Self {
        match cls {
            "resource_group" => ResourceKind::ResourceGroup,
            "vector_layer" => ResourceKind::VectorLayer,
            "postgis_layer" => ResourceKind::PostgisLayer,
            "raster_layer" => ResourceKind::RasterLayer,
            "mapserver_style" | "qgis_vector_style" | "raster_style" => ResourceKind::Style,
            _ => ResourceKind::Unknown,
        }
    }

    /// The tree node kind this resource materializes as, or `None` for
    /// resources the catalog does not represent.
    pub fn node_kind(&self) -> Option<NodeKind> {
        match self {
            ResourceKind::ResourceGroup => Some(NodeKind::ResourceGroup),
            ResourceKind::VectorLayer => Some(NodeKind::VectorLayer),
            ResourceKind::PostgisLayer => Some(NodeKind::PostgisLayer),
            ResourceKind::RasterLayer => Some(NodeKind::RasterLayer),
            ResourceKind::Style => Some(NodeKind::Style),
            ResourceKind::Unknown => None,
        }
    }

    /// Whether this resource can itself contain children.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ResourceKind::ResourceGroup | ResourceKind::VectorLayer | ResourceKind::PostgisLayer
        )
    }
}

/// One entry of a resource children listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub id: i64,
    pub name: String,
    pub kind: ResourceKind,
}

#[derive(Deserialize)]
struct RawChild {
    resource: RawResource,
}

#[derive(Deserialize)]
struct RawResource {
    id: i64,
    cls: String,
    display_name: String,
}

/// Parse a children listing payload.
///
/// The wire shape is a JSON array of `{"resource": {"id", "cls",
/// "display_name"}}` items. A payload that does not parse as a whole is a
/// [`RemoteError::Payload`].
pub fn parse_children(payload: &str) -> Result<Vec<ResourceEntry>, RemoteError> {
    let raw: Vec<RawChild> =
        serde_json::from_str(payload).map_err(|e| RemoteError::Payload(e.to_string()))?;
    Ok(raw
        .into_iter()
        .map(|child| ResourceEntry {
            id: child.resource.id,
            name: child.resource.display_name,
            kind: ResourceKind::classify(&child.resource.cls),
        })
        .collect())
}

/// Access to a remote resource hierarchy.
///
/// Implementations wrap the actual transport; boxed futures keep the trait
/// usable behind `Arc<dyn ResourceService>`.
pub trait ResourceService: Send + Sync {
    /// Children of a resource, already classified.
    fn list_children(
        &self,
        resource_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ResourceEntry>, RemoteError>> + Send + '_>>;

    /// Raw feature payload of a vector resource.
    fn fetch_features(
        &self,
        resource_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<String, RemoteError>> + Send + '_>>;
}

/// One resource container viewed as a [`RemoteListing`] for a reconciler.
///
/// Unknown resources are filtered out, so a reconciler never creates nodes
/// for them.
pub struct ResourceGroupListing {
    service: Arc<dyn ResourceService>,
    resource_id: i64,
}

impl ResourceGroupListing {
    pub fn new(service: Arc<dyn ResourceService>, resource_id: i64) -> Self {
        Self {
            service,
            resource_id,
        }
    }
}

impl RemoteListing for ResourceGroupListing {
    fn list_remote_objects(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Listing, RemoteError>> + Send + '_>> {
        Box::pin(async move {
            let entries = self.service.list_children(self.resource_id).await?;
            Ok(entries
                .into_iter()
                .filter(|e| e.kind != ResourceKind::Unknown)
                .map(|e| (e.id, e.name))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_tags() {
        assert_eq!(
            ResourceKind::classify("resource_group"),
            ResourceKind::ResourceGroup
        );
        assert_eq!(
            ResourceKind::classify("vector_layer"),
            ResourceKind::VectorLayer
        );
        assert_eq!(
            ResourceKind::classify("postgis_layer"),
            ResourceKind::PostgisLayer
        );
        assert_eq!(
            ResourceKind::classify("raster_layer"),
            ResourceKind::RasterLayer
        );
        assert_eq!(
            ResourceKind::classify("mapserver_style"),
            ResourceKind::Style
        );
        assert_eq!(
            ResourceKind::classify("qgis_vector_style"),
            ResourceKind::Style
        );
    }

    #[test]
    fn test_classify_unknown_tag() {
        assert_eq!(
            ResourceKind::classify("wmsserver_service"),
            ResourceKind::Unknown
        );
        assert_eq!(ResourceKind::Unknown.node_kind(), None);
    }

    #[test]
    fn test_parse_children_payload() {
        let payload = r#"[
            {"resource": {"id": 5, "cls": "resource_group", "display_name": "Basemaps"}},
            {"resource": {"id": 6, "cls": "vector_layer", "display_name": "Roads"}},
            {"resource": {"id": 7, "cls": "lookup_table", "display_name": "Codes"}}
        ]"#;
        let entries = parse_children(payload).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            ResourceEntry {
                id: 5,
                name: "Basemaps".to_string(),
                kind: ResourceKind::ResourceGroup
            }
        );
        assert_eq!(entries[1].kind, ResourceKind::VectorLayer);
        assert_eq!(entries[2].kind, ResourceKind::Unknown);
    }

    #[test]
    fn test_parse_children_rejects_malformed_payload() {
        assert!(matches!(
            parse_children("not json"),
            Err(RemoteError::Payload(_))
        ));
        assert!(matches!(
            parse_children(r#"{"resource": {}}"#),
            Err(RemoteError::Payload(_))
        ));
    }

    struct FixedService {
        entries: Vec<ResourceEntry>,
    }

    impl ResourceService for FixedService {
        fn list_children(
            &self,
            _resource_id: i64,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<ResourceEntry>, RemoteError>> + Send + '_>>
        {
            let entries = self.entries.clone();
            Box::pin(async move { Ok(entries) })
        }

        fn fetch_features(
            &self,
            _resource_id: i64,
        ) -> Pin<Box<dyn Future<Output = Result<String, RemoteError>> + Send + '_>> {
            Box::pin(async move { Ok("[]".to_string()) })
        }
    }

    #[tokio::test]
    async fn test_group_listing_filters_unknown_resources() {
        let service = Arc::new(FixedService {
            entries: vec![
                ResourceEntry {
                    id: 1,
                    name: "roads".to_string(),
                    kind: ResourceKind::VectorLayer,
                },
                ResourceEntry {
                    id: 2,
                    name: "mystery".to_string(),
                    kind: ResourceKind::Unknown,
                },
            ],
        });
        let listing = ResourceGroupListing::new(service, 0);
        let objects = listing.list_remote_objects().await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects.get(&1).map(String::as_str), Some("roads"));
    }
}
