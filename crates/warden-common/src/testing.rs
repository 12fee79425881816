//! In-memory fakes for controller tests
//!
//! [`MemoryStore`] implements [`StateStore`] for every kind with the API
//! server behaviours the controllers depend on: `resourceVersion`
//! preconditions, `AlreadyExists` on duplicate creates, generation bumps on
//! spec changes, status written only through the status path, and deletion
//! held back by finalizers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use kube::Resource;
use serde_json::Value;

pub use crate::error::api_error;

use crate::catalog::{SensorCatalog, SensorKind};
use crate::store::{Object, ObjectKey, StateStore};
use crate::{Error, Result};

type StoreKey = (String, Option<String>, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<StoreKey, Value>,
    next_version: u64,
    writes: usize,
    conflicts: u32,
    missed_reads: u32,
    failing_kinds: HashMap<String, (u16, String)>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn check_failure(&self, kind: &str) -> Result<()> {
        match self.failing_kinds.get(kind) {
            Some((code, reason)) => Err(api_error(*code, reason)),
            None => Ok(()),
        }
    }

    fn check_precondition(&mut self, stored: &Value, incoming: &Value) -> Result<()> {
        if self.conflicts > 0 {
            self.conflicts -= 1;
            return Err(api_error(409, "Conflict"));
        }
        let incoming_rv = incoming.pointer("/metadata/resourceVersion");
        match incoming_rv {
            Some(Value::String(rv)) if Some(rv.as_str()) != resource_version(stored) => {
                Err(api_error(409, "Conflict"))
            }
            _ => Ok(()),
        }
    }
}

fn resource_version(v: &Value) -> Option<&str> {
    v.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

fn has_finalizers(v: &Value) -> bool {
    v.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn labels_match(v: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| {
            let (k, val) = term.split_once('=').unwrap_or((term, ""));
            v.pointer("/metadata/labels")
                .and_then(|l| l.get(k))
                .and_then(Value::as_str)
                == Some(val)
        })
}

/// In-memory [`StateStore`]
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Fail the next `n` guarded writes (update, update_status) with a conflict
    pub fn inject_conflicts(&self, n: u32) {
        self.lock().conflicts = n;
    }

    /// Answer the next `n` reads (`get` or `get_latest`) as if the object
    /// did not exist, like a watch cache or a peer that has not caught up
    pub fn miss_reads(&self, n: u32) {
        self.lock().missed_reads = n;
    }

    fn read<K: Object>(&self, key: &ObjectKey) -> Result<Option<K>> {
        let mut inner = self.lock();
        if inner.missed_reads > 0 {
            inner.missed_reads -= 1;
            return Ok(None);
        }
        let stored = inner.objects.get(&store_key::<K>(key)).cloned();
        drop(inner);
        stored.map(decode::<K>).transpose()
    }

    /// Fail every write to `kind` with the given API error until cleared
    pub fn fail_writes(&self, kind: &str, code: u16, reason: &str) {
        self.lock()
            .failing_kinds
            .insert(kind.to_string(), (code, reason.to_string()));
    }

    /// Stop failing writes to `kind`
    pub fn clear_failures(&self, kind: &str) {
        self.lock().failing_kinds.remove(kind);
    }

    /// Whether an object of kind `K` exists at `key`
    pub fn contains<K: Object>(&self, key: &ObjectKey) -> bool {
        self.lock().objects.contains_key(&store_key::<K>(key))
    }

    /// Read an object of kind `K` without going through the async trait
    pub fn object<K: Object>(&self, key: &ObjectKey) -> Option<K> {
        self.lock()
            .objects
            .get(&store_key::<K>(key))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn store_key<K: Object>(key: &ObjectKey) -> StoreKey {
    (
        K::kind(&()).to_string(),
        key.namespace.clone(),
        key.name.clone(),
    )
}

fn decode<K: Object>(v: Value) -> Result<K> {
    serde_json::from_value(v).map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
}

#[async_trait]
impl<K: Object> StateStore<K> for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        self.read(key)
    }

    async fn get_latest(&self, key: &ObjectKey) -> Result<Option<K>> {
        self.read(key)
    }

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let matching: Vec<Value> = self
            .lock()
            .objects
            .iter()
            .filter(|((k, ns, _), v)| {
                *k == kind
                    && namespace.map_or(true, |n| ns.as_deref() == Some(n))
                    && labels_match(v, label_selector)
            })
            .map(|(_, v)| v.clone())
            .collect();
        matching.into_iter().map(decode::<K>).collect()
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = store_key::<K>(&ObjectKey::of(obj));
        let mut inner = self.lock();
        inner.check_failure(&key.0)?;
        if inner.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }

        let mut value = serde_json::to_value(obj)?;
        let version = inner.bump();
        let meta = value
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::serialization("object has no metadata"))?;
        meta.insert("resourceVersion".into(), Value::String(version.clone()));
        meta.entry("uid")
            .or_insert_with(|| Value::String(format!("uid-{version}")));
        meta.entry("generation").or_insert_with(|| Value::from(1));
        meta.insert(
            "creationTimestamp".into(),
            Value::String(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        );

        inner.objects.insert(key, value.clone());
        inner.writes += 1;
        drop(inner);
        decode(value)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = store_key::<K>(&ObjectKey::of(obj));
        let mut inner = self.lock();
        inner.check_failure(&key.0)?;
        let Some(stored) = inner.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound"));
        };

        let mut value = serde_json::to_value(obj)?;
        inner.check_precondition(&stored, &value)?;

        // Status only changes through the status path
        match stored.get("status") {
            Some(status) => {
                value["status"] = status.clone();
            }
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }

        let generation = stored
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if stored.get("spec") != value.get("spec") {
            generation + 1
        } else {
            generation
        };
        let version = inner.bump();
        value["metadata"]["resourceVersion"] = Value::String(version);
        value["metadata"]["generation"] = Value::from(generation);

        inner.writes += 1;
        if value.pointer("/metadata/deletionTimestamp").is_some() && !has_finalizers(&value) {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, value.clone());
        }
        drop(inner);
        decode(value)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        let key = store_key::<K>(key);
        let mut inner = self.lock();
        inner.check_failure(&key.0)?;
        let Some(stored) = inner.objects.get(&key).cloned() else {
            return Ok(false);
        };

        if has_finalizers(&stored) {
            if stored.pointer("/metadata/deletionTimestamp").is_none() {
                let mut marked = stored;
                marked["metadata"]["deletionTimestamp"] =
                    Value::String(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
                let version = inner.bump();
                marked["metadata"]["resourceVersion"] = Value::String(version);
                inner.objects.insert(key, marked);
                inner.writes += 1;
            }
        } else {
            inner.objects.remove(&key);
            inner.writes += 1;
        }
        Ok(true)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let key = store_key::<K>(&ObjectKey::of(obj));
        let mut inner = self.lock();
        inner.check_failure(&key.0)?;
        let Some(mut stored) = inner.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound"));
        };

        let value = serde_json::to_value(obj)?;
        inner.check_precondition(&stored, &value)?;

        stored["status"] = value.get("status").cloned().unwrap_or(Value::Null);
        let version = inner.bump();
        stored["metadata"]["resourceVersion"] = Value::String(version);

        inner.objects.insert(key, stored.clone());
        inner.writes += 1;
        drop(inner);
        decode(stored)
    }
}

/// [`SensorCatalog`] returning a configurable version and token
#[derive(Default)]
pub struct FixedCatalog {
    version: Mutex<String>,
    token: Option<Vec<u8>>,
    failure: Mutex<Option<String>>,
    version_calls: AtomicUsize,
    token_calls: AtomicUsize,
}

impl FixedCatalog {
    /// Catalog that reports `version` for every sensor and channel
    pub fn new(version: &str) -> Self {
        Self {
            version: Mutex::new(version.to_string()),
            token: Some(b"catalog-token".to_vec()),
            ..Default::default()
        }
    }

    /// Catalog without a pull token
    pub fn without_token(mut self) -> Self {
        self.token = None;
        self
    }

    /// Change the reported version
    pub fn set_version(&self, version: &str) {
        if let Ok(mut v) = self.version.lock() {
            *v = version.to_string();
        }
    }

    /// Make version queries fail with `message`, or succeed again with `None`
    pub fn set_failure(&self, message: Option<&str>) {
        if let Ok(mut f) = self.failure.lock() {
            *f = message.map(str::to_string);
        }
    }

    /// Number of version queries served
    pub fn version_calls(&self) -> usize {
        self.version_calls.load(Ordering::SeqCst)
    }

    /// Number of token requests served
    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorCatalog for FixedCatalog {
    async fn latest_version(&self, _sensor: SensorKind, _channel: &str) -> Result<String> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(Error::dependency("version-query", message));
        }
        self.version
            .lock()
            .map(|v| v.clone())
            .map_err(|_| Error::internal_with_context("catalog", "lock poisoned"))
    }

    async fn pull_token(&self) -> Result<Vec<u8>> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        self.token
            .clone()
            .ok_or_else(|| Error::dependency("pull-token", "no token configured"))
    }
}
