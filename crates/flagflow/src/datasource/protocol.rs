//! Wire payloads for the streaming and polling endpoints

use std::collections::HashMap;

use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::model::flag::FeatureFlag;
use crate::model::segment::Segment;
use crate::store::{DataKind, FullDataSet, ItemDescriptor};

/// Body of a stream `put` event: a complete dataset replacement.
#[derive(Debug, Deserialize)]
pub struct PutData {
    pub data: AllData,
}

/// A complete dataset as it appears on the wire; also the body of a polling
/// response.
#[derive(Debug, Default, Deserialize)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, FeatureFlag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

impl AllData {
    /// Preprocesses every entity and produces the store-ready dataset.
    pub fn into_full_data_set(self) -> FullDataSet {
        let segments = self
            .segments
            .into_iter()
            .map(|(key, mut segment)| {
                segment.preprocess();
                (key, ItemDescriptor::segment(segment))
            })
            .collect();
        let flags = self
            .flags
            .into_iter()
            .map(|(key, mut flag)| {
                flag.preprocess();
                (key, ItemDescriptor::flag(flag))
            })
            .collect();
        vec![
            (DataKind::Segments, segments),
            (DataKind::Features, flags),
        ]
    }
}

/// Body of a stream `patch` event: one entity upsert, addressed by path.
#[derive(Debug, Deserialize)]
pub struct PatchData {
    pub path: String,
    pub data: serde_json::Value,
}

/// Body of a stream `delete` event: one tombstone, addressed by path.
#[derive(Debug, Deserialize)]
pub struct DeleteData {
    pub path: String,
    pub version: u64,
}

/// Resolves a stream path like `/flags/my-flag` to its kind and key.
pub fn parse_path(path: &str) -> Result<(DataKind, &str)> {
    if let Some(key) = path.strip_prefix("/flags/") {
        Ok((DataKind::Features, key))
    } else if let Some(key) = path.strip_prefix("/segments/") {
        Ok((DataKind::Segments, key))
    } else {
        Err(Error::InvalidConfig(format!(
            "unrecognized stream event path: {path}"
        )))
    }
}

/// Converts a `patch` body into the descriptor to upsert.
pub fn parse_patch(patch: &PatchData) -> Result<(DataKind, String, ItemDescriptor)> {
    let (kind, key) = parse_path(&patch.path)?;
    let item = match kind {
        DataKind::Features => {
            let mut flag: FeatureFlag = serde_json::from_value(patch.data.clone())?;
            if flag.deleted {
                ItemDescriptor::tombstone(flag.version)
            } else {
                flag.preprocess();
                ItemDescriptor::flag(flag)
            }
        }
        DataKind::Segments => {
            let mut segment: Segment = serde_json::from_value(patch.data.clone())?;
            if segment.deleted {
                ItemDescriptor::tombstone(segment.version)
            } else {
                segment.preprocess();
                ItemDescriptor::segment(segment)
            }
        }
    };
    Ok((kind, key.to_string(), item))
}

/// Converts a `delete` body into the tombstone to upsert.
pub fn parse_delete(delete: &DeleteData) -> Result<(DataKind, String, ItemDescriptor)> {
    let (kind, key) = parse_path(&delete.path)?;
    Ok((kind, key.to_string(), ItemDescriptor::tombstone(delete.version)))
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreItem;
    use serde_json::json;

    #[test]
    fn test_put_payload_parses_both_kinds() {
        let put: PutData = serde_json::from_value(json!({
            "data": {
                "flags": {"f1": {"key": "f1", "version": 1}},
                "segments": {"s1": {"key": "s1", "version": 2}}
            }
        }))
        .unwrap();
        let data = put.data.into_full_data_set();
        assert_eq!(data[0].0, DataKind::Segments);
        assert_eq!(data[0].1.len(), 1);
        assert_eq!(data[1].0, DataKind::Features);
        assert_eq!(data[1].1.len(), 1);
    }

    #[test]
    fn test_put_preprocesses_entities() {
        let put: PutData = serde_json::from_value(json!({
            "data": {
                "flags": {"f1": {
                    "key": "f1", "version": 1, "offVariation": 0, "variations": ["x"]
                }},
                "segments": {}
            }
        }))
        .unwrap();
        let data = put.data.into_full_data_set();
        let (_, item) = &data[1].1[0];
        match item.item.as_ref().unwrap() {
            StoreItem::Flag(f) => assert!(f.preprocessed.off_result.is_some()),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_patch_path_addressing() {
        let patch: PatchData = serde_json::from_value(json!({
            "path": "/flags/f1",
            "data": {"key": "f1", "version": 8}
        }))
        .unwrap();
        let (kind, key, item) = parse_patch(&patch).unwrap();
        assert_eq!(kind, DataKind::Features);
        assert_eq!(key, "f1");
        assert_eq!(item.version, 8);

        let patch: PatchData = serde_json::from_value(json!({
            "path": "/segments/s1",
            "data": {"key": "s1", "version": 3}
        }))
        .unwrap();
        let (kind, ..) = parse_patch(&patch).unwrap();
        assert_eq!(kind, DataKind::Segments);
    }

    #[test]
    fn test_patch_with_deleted_entity_is_tombstone() {
        let patch: PatchData = serde_json::from_value(json!({
            "path": "/flags/f1",
            "data": {"key": "f1", "version": 9, "deleted": true}
        }))
        .unwrap();
        let (_, _, item) = parse_patch(&patch).unwrap();
        assert!(item.is_tombstone());
        assert_eq!(item.version, 9);
    }

    #[test]
    fn test_delete_payload() {
        let delete: DeleteData = serde_json::from_value(json!({
            "path": "/flags/f1", "version": 10
        }))
        .unwrap();
        let (kind, key, item) = parse_delete(&delete).unwrap();
        assert_eq!(kind, DataKind::Features);
        assert_eq!(key, "f1");
        assert!(item.is_tombstone());
    }

    #[test]
    fn test_unrecognized_path_is_an_error() {
        assert!(parse_path("/widgets/w1").is_err());
        assert!(parse_path("flags/f1").is_err());
    }
}
