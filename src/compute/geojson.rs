//! GeoJSON export for snapshots and clusters.

use super::cluster::Cluster;
use crate::error::{GeoquadError, Result};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue, Value};
use geoquad_types::point::DataSnapshot;
use geoquad_types::record::PrimaryKey;

fn primary_key_json(key: &PrimaryKey) -> JsonValue {
    match key {
        PrimaryKey::Str(s) => JsonValue::from(s.as_str()),
        PrimaryKey::Int(i) => JsonValue::from(*i),
    }
}

/// Converts a snapshot into a GeoJSON point feature.
pub fn snapshot_to_feature(snapshot: &DataSnapshot) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert(
        "entity_class".to_string(),
        JsonValue::from(snapshot.entity_class()),
    );
    properties.insert(
        "primary_key".to_string(),
        primary_key_json(snapshot.primary_key()),
    );

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::Point(vec![
            snapshot.longitude,
            snapshot.latitude,
        ]))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Converts a cluster into a GeoJSON point feature at its centroid.
///
/// Properties carry the member count, the member keys and the title and
/// subtitle when they have been resolved.
pub fn cluster_to_feature(cluster: &Cluster) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("count".to_string(), JsonValue::from(cluster.count));
    properties.insert(
        "members".to_string(),
        JsonValue::Array(
            cluster
                .members
                .iter()
                .map(|m| primary_key_json(m.primary_key()))
                .collect(),
        ),
    );
    if let Some(title) = &cluster.title {
        properties.insert("title".to_string(), JsonValue::from(title.as_str()));
    }
    if let Some(subtitle) = &cluster.subtitle {
        properties.insert("subtitle".to_string(), JsonValue::from(subtitle.as_str()));
    }

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::Point(vec![
            cluster.coordinate.x(),
            cluster.coordinate.y(),
        ]))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn collection_to_string(features: Vec<Feature>, what: &str) -> Result<String> {
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };

    serde_json::to_string(&collection).map_err(|e| {
        GeoquadError::SerializationErrorWithContext(format!("Failed to serialize {}: {}", what, e))
    })
}

/// Serializes snapshots as a GeoJSON feature collection.
pub fn snapshots_to_geojson(snapshots: &[DataSnapshot]) -> Result<String> {
    collection_to_string(
        snapshots.iter().map(snapshot_to_feature).collect(),
        "snapshots",
    )
}

/// Serializes clusters as a GeoJSON feature collection.
pub fn clusters_to_geojson(clusters: &[Cluster]) -> Result<String> {
    collection_to_string(clusters.iter().map(cluster_to_feature).collect(), "clusters")
}
