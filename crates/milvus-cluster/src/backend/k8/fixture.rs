//! In-memory `MilvusApi` for backend tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use k8_types::{InputK8Obj, K8Obj};
use serde_json::Value;

use crate::BackendError;

use super::client::MilvusApi;
use super::resource::{MilvusObj, MilvusSpec, MilvusStatus};

/// Stores resources by `(namespace, name)` and reports a fixed status after
/// every write, standing in for the operator.
#[derive(Debug)]
pub struct MemoryMilvusApi {
    crd_installed: AtomicBool,
    status_after_write: Mutex<String>,
    failing_reads: AtomicU32,
    hanging_reads: AtomicBool,
    reads: AtomicU32,
    objects: Mutex<BTreeMap<(String, String), MilvusObj>>,
    patches: Mutex<Vec<Value>>,
}

impl Default for MemoryMilvusApi {
    fn default() -> Self {
        Self {
            crd_installed: AtomicBool::new(true),
            status_after_write: Mutex::new(crate::diagnose::HEALTHY.to_owned()),
            failing_reads: AtomicU32::new(0),
            hanging_reads: AtomicBool::new(false),
            reads: AtomicU32::new(0),
            objects: Mutex::new(BTreeMap::new()),
            patches: Mutex::new(vec![]),
        }
    }
}

impl MemoryMilvusApi {
    pub fn without_crd() -> Self {
        let api = Self::default();
        api.crd_installed.store(false, Ordering::SeqCst);
        api
    }

    /// Status the fake operator reports after create and patch
    pub fn set_status_after_write(&self, status: &str) {
        *self.status_after_write.lock().expect("lock") = status.to_owned();
    }

    /// Makes the next `count` reads fail
    pub fn fail_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Makes every read wait forever, like an API server that stopped answering
    pub fn hang_reads(&self) {
        self.hanging_reads.store(true, Ordering::SeqCst);
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn insert(&self, namespace: &str, name: &str, spec: MilvusSpec, status: MilvusStatus) {
        let mut obj = K8Obj::new(name, spec);
        obj.metadata.namespace = namespace.to_owned();
        obj.status = status;
        self.objects
            .lock()
            .expect("lock")
            .insert((namespace.to_owned(), name.to_owned()), obj);
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<MilvusObj> {
        self.objects
            .lock()
            .expect("lock")
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn patches(&self) -> Vec<Value> {
        self.patches.lock().expect("lock").clone()
    }

    fn status(&self) -> MilvusStatus {
        MilvusStatus {
            status: self.status_after_write.lock().expect("lock").clone(),
            ..Default::default()
        }
    }
}

/// JSON merge patch: objects merge, `null` removes, everything else replaces
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[async_trait]
impl MilvusApi for MemoryMilvusApi {
    async fn crd_installed(&self, _namespace: &str) -> Result<bool, BackendError> {
        Ok(self.crd_installed.load(Ordering::SeqCst))
    }

    async fn get(&self, name: &str, namespace: &str) -> Result<Option<MilvusObj>, BackendError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.hanging_reads.load(Ordering::SeqCst) {
            futures_util::future::pending::<()>().await;
        }
        let failing = self.failing_reads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reads.store(failing - 1, Ordering::SeqCst);
            return Err(BackendError::Unavailable {
                what: "Kubernetes API".to_owned(),
                hint: "connection reset".to_owned(),
            });
        }
        Ok(self.object(namespace, name))
    }

    async fn create(&self, input: InputK8Obj<MilvusSpec>) -> Result<MilvusObj, BackendError> {
        let key = (input.metadata.namespace.clone(), input.metadata.name.clone());
        let mut obj = K8Obj::new(input.metadata.name.clone(), input.spec);
        obj.metadata.namespace = input.metadata.namespace;
        obj.metadata.labels = input.metadata.labels;
        obj.status = self.status();

        let mut objects = self.objects.lock().expect("lock");
        if objects.contains_key(&key) {
            return Err(BackendError::ResourceExists {
                name: key.1,
                namespace: key.0,
            });
        }
        objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn patch_spec(
        &self,
        name: &str,
        namespace: &str,
        patch: &Value,
    ) -> Result<MilvusObj, BackendError> {
        self.patches.lock().expect("lock").push(patch.clone());
        let status = self.status();
        let mut objects = self.objects.lock().expect("lock");
        let Some(obj) = objects.get_mut(&(namespace.to_owned(), name.to_owned())) else {
            return Err(BackendError::ResourceNotFound {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            });
        };

        let mut spec = serde_json::to_value(&obj.spec)?;
        if let Some(spec_patch) = patch.get("spec") {
            merge_patch(&mut spec, spec_patch);
        }
        obj.spec = serde_json::from_value(spec)?;
        obj.status = status;
        Ok(obj.clone())
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<bool, BackendError> {
        Ok(self
            .objects
            .lock()
            .expect("lock")
            .remove(&(namespace.to_owned(), name.to_owned()))
            .is_some())
    }
}
