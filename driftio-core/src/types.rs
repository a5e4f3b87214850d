use crate::{DriftError, Result};
use serde::{Deserialize, Serialize};

/// Object key within a bucket: name plus version instance. The empty
/// instance (or the literal "null") addresses the current version of an
/// unversioned object.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjKey {
    pub name: String,
    #[serde(default)]
    pub instance: String,
}

impl ObjKey {
    pub fn new(name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: instance.into(),
        }
    }

    pub fn has_instance(&self) -> bool {
        !self.instance.is_empty() && self.instance != "null"
    }
}

impl std::fmt::Display for ObjKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.instance.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}[{}]", self.name, self.instance)
        }
    }
}

/// One shard of one bucket instance. `shard_id` is -1 for unsharded buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketShard {
    pub bucket_name: String,
    pub bucket_id: String,
    pub shard_id: i32,
}

impl BucketShard {
    pub fn new(bucket_name: impl Into<String>, bucket_id: impl Into<String>, shard_id: i32) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            bucket_id: bucket_id.into(),
            shard_id,
        }
    }

    /// `<bucket_name>:<bucket_id>[:<shard_id>]`, the identifier used in
    /// datalog keys, bucket-instance requests and status object names.
    pub fn instance_key(&self) -> String {
        if self.shard_id >= 0 {
            format!("{}:{}:{}", self.bucket_name, self.bucket_id, self.shard_id)
        } else {
            format!("{}:{}", self.bucket_name, self.bucket_id)
        }
    }
}

impl std::fmt::Display for BucketShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.instance_key())
    }
}

/// Parse a raw datalog key of the form `bucket[:bucket_id[:shard_id]]`.
pub fn parse_bucket_shard(raw_key: &str) -> Result<BucketShard> {
    if raw_key.is_empty() {
        return Err(DriftError::InvalidEntry("empty bucket shard key".to_string()));
    }

    let (bucket_name, rest) = match raw_key.split_once(':') {
        Some((name, rest)) => (name.to_string(), rest),
        None => return Ok(BucketShard::new(raw_key, "", -1)),
    };

    match rest.rsplit_once(':') {
        Some((bucket_id, shard)) => {
            let shard_id = shard.parse::<i32>().map_err(|_| {
                DriftError::InvalidEntry(format!("bad shard id in bucket shard key: {}", raw_key))
            })?;
            Ok(BucketShard::new(bucket_name, bucket_id, shard_id))
        }
        None => Ok(BucketShard::new(bucket_name, rest, -1)),
    }
}

/// Object-level operation carried by a bucket index log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOp {
    Add,
    LinkOlh,
    Del,
    /// Ops this engine does not replicate (e.g. olh cancellations). They
    /// still advance the marker.
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unsharded_key() {
        let bs = parse_bucket_shard("photos:inst-9").unwrap();
        assert_eq!(bs.bucket_name, "photos");
        assert_eq!(bs.bucket_id, "inst-9");
        assert_eq!(bs.shard_id, -1);
        assert_eq!(bs.instance_key(), "photos:inst-9");
    }

    #[test]
    fn parses_sharded_key() {
        let bs = parse_bucket_shard("photos:inst-9:4").unwrap();
        assert_eq!(bs.bucket_name, "photos");
        assert_eq!(bs.bucket_id, "inst-9");
        assert_eq!(bs.shard_id, 4);
        assert_eq!(bs.instance_key(), "photos:inst-9:4");
    }

    #[test]
    fn rejects_garbage_shard_id() {
        let err = parse_bucket_shard("photos:inst-9:abc").unwrap_err();
        assert!(matches!(err, DriftError::InvalidEntry(_)));
    }

    #[test]
    fn bare_bucket_name_is_unsharded() {
        let bs = parse_bucket_shard("photos").unwrap();
        assert_eq!(bs.bucket_name, "photos");
        assert_eq!(bs.bucket_id, "");
        assert_eq!(bs.shard_id, -1);
    }

    #[test]
    fn obj_key_instance_detection() {
        assert!(!ObjKey::new("a", "").has_instance());
        assert!(!ObjKey::new("a", "null").has_instance());
        assert!(ObjKey::new("a", "v1").has_instance());
    }

    #[test]
    fn log_op_decodes_unknown_as_other() {
        let op: LogOp = serde_json::from_str("\"link_olh\"").unwrap();
        assert_eq!(op, LogOp::LinkOlh);
        let op: LogOp = serde_json::from_str("\"cancel\"").unwrap();
        assert_eq!(op, LogOp::Other);
    }
}
