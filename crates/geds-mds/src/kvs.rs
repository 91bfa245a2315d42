//! The metadata key-value store: buckets mapping ordered keys to object-info
//! records.
//!
//! The bucket map lock is exclusive only for bucket insertion/removal; value
//! mutation goes through the per-entry lock so re-seals do not serialize
//! against lookups of unrelated keys.

use geds_proto::{Object, ObjectId, ObjectInfo};
use geds_util::concurrent::ConcurrentMap;
use geds_util::path::{prefix_range, Path};
use geds_util::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub struct KvsBucket {
    name: String,
    map: RwLock<BTreeMap<Path, Arc<RwLock<ObjectInfo>>>>,
}

impl KvsBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn get_object(&self, key: &str) -> Result<Arc<RwLock<ObjectInfo>>> {
        self.map
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("key {key} does not exist")))
    }

    /// Insert `obj`, silently replacing an existing record.
    pub fn create_object(&self, obj: Object) -> Result<()> {
        let mut map = self.map.write();
        let path = Path::new(obj.id.key);
        if map.contains_key(&path) {
            tracing::debug!(bucket = %self.name, key = %path, "overwriting existing object");
        }
        map.insert(path, Arc::new(RwLock::new(obj.info)));
        Ok(())
    }

    /// Replace the info of an existing record; NotFound otherwise.
    pub fn update_object(&self, obj: Object) -> Result<()> {
        let entry = self.get_object(&obj.id.key)?;
        *entry.write() = obj.info;
        Ok(())
    }

    pub fn delete_object(&self, key: &str) -> Result<()> {
        let mut map = self.map.write();
        map.remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("key {key} does not exist")))
    }

    /// Remove the contiguous range of keys starting with `prefix`. NotFound
    /// iff no key matched.
    pub fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut map = self.map.write();
        let matches: Vec<Path> = prefix_range(&map, prefix).map(|(k, _)| k.clone()).collect();
        if matches.is_empty() {
            return Err(Error::NotFound(format!(
                "no objects starting with {prefix} found"
            )));
        }
        for key in matches {
            map.remove(&key);
        }
        Ok(())
    }

    /// Snapshot of the record for `key`.
    pub fn lookup(&self, key: &str) -> Result<Object> {
        let entry = self.get_object(key)?;
        let info = entry.read().clone();
        Ok(Object {
            id: ObjectId::new(self.name.clone(), key),
            info,
        })
    }

    /// Objects and common prefixes below `prefix`. With a delimiter, any key
    /// containing it past the prefix folds into a deduplicated common prefix
    /// that includes the delimiter (AWS semantics).
    pub fn list(
        &self,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<(Vec<Object>, Vec<String>)> {
        let map = self.map.read();
        let mut objects = Vec::new();
        let mut common_prefixes = BTreeSet::new();

        for (path, entry) in prefix_range(&map, prefix) {
            if let Some(delimiter) = delimiter {
                if let Some(at) = path.name[prefix.len()..].find(delimiter) {
                    let end = prefix.len() + at + delimiter.len_utf8();
                    common_prefixes.insert(path.name[..end].to_string());
                    continue;
                }
            }
            objects.push(Object {
                id: ObjectId::new(self.name.clone(), path.name.clone()),
                info: entry.read().clone(),
            });
        }
        Ok((objects, common_prefixes.into_iter().collect()))
    }

    pub fn forall(&self, mut action: impl FnMut(&Path, &ObjectInfo)) {
        for (path, entry) in self.map.read().iter() {
            action(path, &entry.read());
        }
    }
}

#[derive(Default)]
pub struct Kvs {
    buckets: ConcurrentMap<String, Arc<KvsBucket>>,
}

impl Kvs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_bucket(&self, bucket: &str) -> Result<Arc<KvsBucket>> {
        self.buckets
            .get(&bucket.to_string())
            .ok_or_else(|| Error::NotFound(format!("bucket {bucket} does not exist")))
    }

    pub fn create_bucket(&self, bucket: &str) -> Result<()> {
        let created = Arc::new(KvsBucket::new(bucket));
        let stored = self
            .buckets
            .insert_or_exists(bucket.to_string(), created.clone());
        if !Arc::ptr_eq(&stored, &created) {
            return Err(Error::AlreadyExists(format!(
                "bucket {bucket} already exists"
            )));
        }
        Ok(())
    }

    pub fn delete_bucket(&self, bucket: &str) -> Result<()> {
        if self.buckets.remove(&bucket.to_string()) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("bucket {bucket} does not exist")))
        }
    }

    pub fn list_buckets(&self) -> Vec<String> {
        let mut result = Vec::new();
        self.buckets.forall(|name, _| result.push(name.clone()));
        result.sort();
        result
    }

    pub fn bucket_status(&self, bucket: &str) -> Result<()> {
        self.get_bucket(bucket).map(|_| ())
    }

    /// Create an object; `force_create_bucket` first creates the bucket when
    /// absent.
    pub fn create_object(&self, obj: Object, force_create_bucket: bool) -> Result<()> {
        let bucket = match self.get_bucket(&obj.id.bucket) {
            Ok(bucket) => bucket,
            Err(err) if err.is_not_found() && force_create_bucket => {
                // A racing creator is fine, the bucket exists either way.
                let _ = self.create_bucket(&obj.id.bucket);
                self.get_bucket(&obj.id.bucket)?
            }
            Err(err) => return Err(err),
        };
        bucket.create_object(obj)
    }

    pub fn update_object(&self, obj: Object) -> Result<()> {
        self.get_bucket(&obj.id.bucket)?.update_object(obj)
    }

    pub fn delete_object(&self, id: &ObjectId) -> Result<()> {
        self.get_bucket(&id.bucket)?.delete_object(&id.key)
    }

    pub fn delete_prefix(&self, id: &ObjectId) -> Result<()> {
        self.get_bucket(&id.bucket)?.delete_prefix(&id.key)
    }

    pub fn lookup(&self, id: &ObjectId) -> Result<Object> {
        self.get_bucket(&id.bucket)?.lookup(&id.key)
    }

    pub fn list(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<(Vec<Object>, Vec<String>)> {
        self.get_bucket(bucket)?.list(prefix, delimiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(bucket: &str, key: &str, location: &str, size: u64) -> Object {
        Object {
            id: ObjectId::new(bucket, key),
            info: ObjectInfo::sealed(location, size),
        }
    }

    #[test]
    fn create_and_list_by_prefix() {
        let kvs = Kvs::new();
        let bucket = "test-basic";
        kvs.create_bucket(bucket).unwrap();

        for i in 0..10 {
            kvs.create_object(object(bucket, &format!("/{i}"), &format!("node{i}"), 0), false)
                .unwrap();
        }
        let (objects, prefixes) = kvs.list(bucket, "/", None).unwrap();
        assert_eq!(objects.len(), 10);
        assert!(prefixes.is_empty());

        for i in 0..10 {
            kvs.create_object(
                object(bucket, &format!("/2/{i}"), &format!("node{i}"), 0),
                false,
            )
            .unwrap();
        }
        let (objects, _) = kvs.list(bucket, "/2/", None).unwrap();
        assert_eq!(objects.len(), 10);

        // Without a delimiter everything below "/" is visible.
        let (objects, _) = kvs.list(bucket, "/", None).unwrap();
        assert_eq!(objects.len(), 20);

        // With '/' as delimiter, the nested keys fold into "/2/".
        let (objects, prefixes) = kvs.list(bucket, "/", Some('/')).unwrap();
        assert_eq!(objects.len(), 10);
        assert_eq!(prefixes, vec!["/2/".to_string()]);
    }

    #[test]
    fn common_prefixes_are_deduplicated_and_include_delimiter() {
        let kvs = Kvs::new();
        kvs.create_bucket("geds-test").unwrap();
        for key in ["a/1", "a/2", "a/b/c", "b/1", "top"] {
            kvs.create_object(object("geds-test", key, "node1", 1), false)
                .unwrap();
        }
        let (objects, prefixes) = kvs.list("geds-test", "", Some('/')).unwrap();
        assert_eq!(prefixes, vec!["a/".to_string(), "b/".to_string()]);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].id.key, "top");

        let (objects, prefixes) = kvs.list("geds-test", "a/", Some('/')).unwrap();
        assert_eq!(prefixes, vec!["a/b/".to_string()]);
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn delete_semantics() {
        let kvs = Kvs::new();
        let bucket = "test-delete";
        kvs.create_bucket(bucket).unwrap();
        for i in 0..10 {
            kvs.create_object(object(bucket, &format!("/{i}"), "node", 0), false)
                .unwrap();
        }

        kvs.delete_object(&ObjectId::new(bucket, "/1")).unwrap();
        assert!(kvs
            .delete_object(&ObjectId::new(bucket, "/1"))
            .unwrap_err()
            .is_not_found());
        kvs.delete_prefix(&ObjectId::new(bucket, "/")).unwrap();
        assert!(kvs
            .delete_prefix(&ObjectId::new(bucket, "/"))
            .unwrap_err()
            .is_not_found());
        let (objects, _) = kvs.list(bucket, "/", None).unwrap();
        assert!(objects.is_empty());
    }

    #[test]
    fn delete_prefix_leaves_siblings_alone() {
        let kvs = Kvs::new();
        kvs.create_bucket("geds-test").unwrap();
        for key in ["a/1", "a/2", "ab", "b/1"] {
            kvs.create_object(object("geds-test", key, "node", 0), false)
                .unwrap();
        }
        kvs.delete_prefix(&ObjectId::new("geds-test", "a/")).unwrap();
        let (objects, _) = kvs.list("geds-test", "", None).unwrap();
        let keys: Vec<&str> = objects.iter().map(|o| o.id.key.as_str()).collect();
        assert_eq!(keys, vec!["ab", "b/1"]);
    }

    #[test]
    fn create_overwrites_and_update_requires_existence() {
        let kvs = Kvs::new();
        kvs.create_bucket("geds-test").unwrap();
        kvs.create_object(object("geds-test", "k", "node1", 1), false)
            .unwrap();
        kvs.create_object(object("geds-test", "k", "node2", 2), false)
            .unwrap();
        assert_eq!(
            kvs.lookup(&ObjectId::new("geds-test", "k")).unwrap().info.location,
            "node2"
        );

        assert!(kvs
            .update_object(object("geds-test", "missing", "node", 1))
            .unwrap_err()
            .is_not_found());
        kvs.update_object(object("geds-test", "k", "node3", 3)).unwrap();
        assert_eq!(
            kvs.lookup(&ObjectId::new("geds-test", "k")).unwrap().info.size,
            3
        );
    }

    #[test]
    fn bucket_lifecycle() {
        let kvs = Kvs::new();
        kvs.create_bucket("geds-test").unwrap();
        assert!(matches!(
            kvs.create_bucket("geds-test"),
            Err(Error::AlreadyExists(_))
        ));
        assert!(kvs.bucket_status("geds-test").is_ok());
        assert_eq!(kvs.list_buckets(), vec!["geds-test".to_string()]);
        kvs.delete_bucket("geds-test").unwrap();
        assert!(kvs.delete_bucket("geds-test").unwrap_err().is_not_found());

        // Force-create inserts the bucket on demand.
        kvs.create_object(object("auto-bucket", "k", "node", 0), true)
            .unwrap();
        assert!(kvs.bucket_status("auto-bucket").is_ok());
    }
}
