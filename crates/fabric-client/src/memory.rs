//! In-memory ObjectClient for unit testing
//!
//! Emulates the parts of the API server the controllers rely on: generated
//! names, UIDs, monotonic `resourceVersion`, conditional merge patches,
//! finalizer-gated deletion, a separate status subresource and (approximate)
//! server-side apply.

use crate::client::{FabricResource, ObjectClient};
use crate::error::ClientError;
use crate::key::ObjectKey;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[derive(Debug)]
struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    resource_version: u64,
    injected: VecDeque<ClientError>,
}

/// In-memory store for one resource kind
#[derive(Debug)]
pub struct MemoryClient<K> {
    state: Arc<Mutex<State<K>>>,
}

impl<K> Clone for MemoryClient<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K: FabricResource> Default for MemoryClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn metadata_mut(value: &mut Value) -> Result<&mut Map<String, Value>, ClientError> {
    let object = value
        .as_object_mut()
        .ok_or_else(|| ClientError::Api("object is not a JSON map".to_string()))?;
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    metadata
        .as_object_mut()
        .ok_or_else(|| ClientError::Api("metadata is not a JSON map".to_string()))
}

fn finalizers_empty(value: &Value) -> bool {
    value
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_none_or(Vec::is_empty)
}

fn is_deleting(value: &Value) -> bool {
    value.pointer("/metadata/deletionTimestamp").is_some_and(|v| !v.is_null())
}

/// Increment `metadata.generation` when the spec differs from `spec_before`.
fn bump_generation(value: &mut Value, spec_before: Option<Value>) -> Result<(), ClientError> {
    if value.get("spec").cloned() == spec_before {
        return Ok(());
    }
    let generation = value
        .pointer("/metadata/generation")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    metadata_mut(value)?.insert("generation".to_string(), json!(generation + 1));
    Ok(())
}

impl<K: FabricResource> MemoryClient<K> {
    /// Empty store
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                objects: BTreeMap::new(),
                resource_version: 0,
                injected: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next mutating call fail with `err`
    pub fn fail_next(&self, err: ClientError) {
        self.lock().injected.push_back(err);
    }

    /// Store `obj` as if it had been created (test setup)
    pub fn seed(&self, obj: K) -> Result<K, ClientError> {
        Self::create_locked(&mut self.lock(), &obj, false)
    }

    /// Snapshot of every stored object, ordered by key
    pub fn objects(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    /// Stored object by key
    pub fn object(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    fn injected(state: &mut State<K>) -> Result<(), ClientError> {
        match state.injected.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_resource_version(state: &mut State<K>) -> String {
        state.resource_version += 1;
        state.resource_version.to_string()
    }

    fn create_locked(state: &mut State<K>, obj: &K, dry_run: bool) -> Result<K, ClientError> {
        let mut value = serde_json::to_value(obj)?;
        let resource_version = Self::next_resource_version(state);
        let meta = metadata_mut(&mut value)?;

        let namespace = meta
            .get("namespace")
            .and_then(Value::as_str)
            .map(str::to_string);
        let name = match meta.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                let prefix = meta
                    .get("generateName")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ClientError::Invalid("metadata.name or generateName required".to_string())
                    })?
                    .to_string();
                let mut generated = None;
                for _ in 0..8 {
                    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(5).collect();
                    let candidate = format!("{prefix}{suffix}");
                    let key = ObjectKey {
                        namespace: namespace.clone(),
                        name: candidate.clone(),
                    };
                    if !state.objects.contains_key(&key) {
                        generated = Some(candidate);
                        break;
                    }
                }
                generated.ok_or_else(|| ClientError::AlreadyExists(prefix.clone()))?
            }
        };
        let key = ObjectKey {
            namespace,
            name: name.clone(),
        };
        if state.objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists(key.to_string()));
        }

        meta.insert("name".to_string(), json!(name));
        meta.insert("uid".to_string(), json!(uuid::Uuid::new_v4().to_string()));
        meta.insert("resourceVersion".to_string(), json!(resource_version));
        meta.insert("generation".to_string(), json!(1));
        meta.insert("creationTimestamp".to_string(), json!(now()));
        meta.remove("deletionTimestamp");

        let created: K = serde_json::from_value(value)?;
        if !dry_run {
            state.objects.insert(key, created.clone());
        }
        Ok(created)
    }

    /// Store `value` under `key`, or drop it once deletion has no finalizers left.
    fn commit(state: &mut State<K>, key: &ObjectKey, mut value: Value) -> Result<K, ClientError> {
        let resource_version = Self::next_resource_version(state);
        metadata_mut(&mut value)?.insert("resourceVersion".to_string(), json!(resource_version));
        let obj: K = serde_json::from_value(value.clone())?;
        if is_deleting(&value) && finalizers_empty(&value) {
            state.objects.remove(key);
        } else {
            state.objects.insert(key.clone(), obj.clone());
        }
        Ok(obj)
    }

    fn patch_locked(
        state: &mut State<K>,
        key: &ObjectKey,
        patch: &Value,
        status_only: bool,
    ) -> Result<K, ClientError> {
        Self::injected(state)?;
        let existing = state
            .objects
            .get(key)
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        let mut value = serde_json::to_value(existing)?;

        let current = value
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str)
            && expected != current
        {
            return Err(ClientError::Conflict(format!(
                "{key}: resourceVersion {expected} does not match {current}"
            )));
        }

        let mut patch = patch.clone();
        if status_only {
            let status = patch.get("status").cloned().unwrap_or(Value::Null);
            patch = json!({ "status": status });
            if status.is_null() {
                return serde_json::from_value(value).map_err(ClientError::from);
            }
        } else if let Some(map) = patch.as_object_mut() {
            map.remove("status");
            if let Some(Value::Object(meta)) = map.get_mut("metadata") {
                for immutable in [
                    "name",
                    "namespace",
                    "uid",
                    "resourceVersion",
                    "generation",
                    "creationTimestamp",
                    "deletionTimestamp",
                ] {
                    meta.remove(immutable);
                }
            }
        }

        let spec_before = value.get("spec").cloned();
        merge_patch(&mut value, &patch);
        bump_generation(&mut value, spec_before)?;
        Self::commit(state, key, value)
    }
}

#[async_trait::async_trait]
impl<K: FabricResource> ObjectClient<K> for MemoryClient<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, ClientError> {
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, ClientError> {
        let state = self.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .filter(|(_, obj)| {
                let object_labels = obj.meta().labels.as_ref();
                labels
                    .iter()
                    .all(|(k, v)| object_labels.and_then(|l| l.get(k)) == Some(v))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K, dry_run: bool) -> Result<K, ClientError> {
        let mut state = self.lock();
        Self::injected(&mut state)?;
        Self::create_locked(&mut state, obj, dry_run)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<K, ClientError> {
        Self::patch_locked(&mut self.lock(), key, patch, false)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<K, ClientError> {
        Self::patch_locked(&mut self.lock(), key, patch, true)
    }

    async fn apply(&self, obj: &K, _field_manager: &str) -> Result<K, ClientError> {
        let mut state = self.lock();
        Self::injected(&mut state)?;
        let key = ObjectKey::of(obj);
        if key.name.is_empty() {
            return Err(ClientError::Api("apply requires metadata.name".to_string()));
        }
        let Some(existing) = state.objects.get(&key) else {
            return Self::create_locked(&mut state, obj, false);
        };

        let desired = serde_json::to_value(obj)?;
        let mut value = serde_json::to_value(existing)?;
        let spec_before = value.get("spec").cloned();
        if let (Some(target), Some(source)) = (value.as_object_mut(), desired.as_object()) {
            for (field, content) in source {
                if !matches!(field.as_str(), "metadata" | "status" | "apiVersion" | "kind") {
                    target.insert(field.clone(), content.clone());
                }
            }
        }
        for field in ["labels", "annotations", "ownerReferences"] {
            if let Some(content) = desired.pointer(&format!("/metadata/{field}")) {
                let meta = metadata_mut(&mut value)?;
                let mut merged = meta.get(field).cloned().unwrap_or(Value::Null);
                merge_patch(&mut merged, content);
                meta.insert(field.to_string(), merged);
            }
        }
        bump_generation(&mut value, spec_before)?;
        Self::commit(&mut state, &key, value)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        let mut state = self.lock();
        Self::injected(&mut state)?;
        let existing = state
            .objects
            .get(key)
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        let mut value = serde_json::to_value(existing)?;
        if finalizers_empty(&value) {
            state.objects.remove(key);
            return Ok(());
        }
        if !is_deleting(&value) {
            metadata_mut(&mut value)?.insert("deletionTimestamp".to_string(), json!(now()));
            Self::commit(&mut state, key, value)?;
        }
        Ok(())
    }
}
