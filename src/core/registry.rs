//! Purpose: Per-node resource registry: install cache, partitioned object store,
//! propagated variables, and in-flight call tracking.
//! Exports: `Registry`, `Partition`, `StoredObject`, `ActiveCall`, `ActiveCallGuard`.
//! Role: The only shared mutable state on a node; owned by the node and passed by reference.
//! Invariants: `installed_envs` is append-only for the registry's lifetime.
//! Invariants: Installs of one content hash never overlap (per-hash single flight).
//! Invariants: An object key lives in exactly one partition.
//! Notes: Lock order is index before any partition's objects.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use getrandom::fill as fill_random;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use crate::core::envelope::CallKind;
use crate::core::environment::Secret;
use crate::core::error::{Error, ErrorKind};
use crate::core::hex::hex_encode;

pub const ENV_RESOURCE_TYPE: &str = "env";
pub const FUNCTION_RESOURCE_TYPE: &str = "function";
pub const OBJECT_RESOURCE_TYPE: &str = "object";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub value: Value,
    pub resource_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCall {
    pub id: String,
    pub kind: CallKind,
    pub started: String,
}

pub struct Partition {
    name: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    env_vars: Mutex<BTreeMap<String, String>>,
    secrets: Mutex<BTreeMap<String, Secret>>,
    active: Mutex<BTreeMap<String, Vec<ActiveCall>>>,
}

impl Partition {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            env_vars: Mutex::new(BTreeMap::new()),
            secrets: Mutex::new(BTreeMap::new()),
            active: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn objects(&self) -> BTreeMap<String, StoredObject> {
        lock(&self.objects).clone()
    }

    pub fn env_vars(&self) -> BTreeMap<String, String> {
        lock(&self.env_vars).clone()
    }

    pub fn secret_names(&self) -> Vec<String> {
        lock(&self.secrets).keys().cloned().collect()
    }

    /// Variables for processes spawned in this partition: propagated env vars, then
    /// secret values.
    pub fn process_env(&self) -> BTreeMap<String, String> {
        let mut vars = self.env_vars();
        for secret in lock(&self.secrets).values() {
            vars.extend(secret.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        vars
    }

    pub fn active_calls(&self, key: &str) -> Vec<ActiveCall> {
        lock(&self.active).get(key).cloned().unwrap_or_default()
    }
}

/// Removes its call from the partition's active list when dropped.
pub struct ActiveCallGuard {
    partition: Arc<Partition>,
    key: String,
    id: String,
}

impl ActiveCallGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ActiveCallGuard {
    fn drop(&mut self) {
        let mut active = lock(&self.partition.active);
        if let Some(calls) = active.get_mut(&self.key) {
            calls.retain(|call| call.id != self.id);
            if calls.is_empty() {
                active.remove(&self.key);
            }
        }
    }
}

#[derive(Default)]
pub struct Registry {
    installed: Mutex<BTreeMap<String, String>>,
    install_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    partitions: RwLock<BTreeMap<String, Arc<Partition>>>,
    index: Mutex<BTreeMap<String, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `install` unless `hash` is already recorded. Concurrent callers with the same
    /// hash wait for the first; the hash is recorded only after `install` succeeds.
    pub fn install_once<F>(
        &self,
        hash: &str,
        name: &str,
        force: bool,
        install: F,
    ) -> Result<bool, Error>
    where
        F: FnOnce() -> Result<(), Error>,
    {
        let flight = lock(&self.install_locks)
            .entry(hash.to_string())
            .or_default()
            .clone();
        let _guard = lock(&flight);
        if !force && lock(&self.installed).contains_key(hash) {
            debug!(hash, env = name, "environment already installed");
            return Ok(false);
        }
        install()?;
        lock(&self.installed)
            .entry(hash.to_string())
            .or_insert_with(|| name.to_string());
        Ok(true)
    }

    pub fn installed_envs(&self) -> BTreeMap<String, String> {
        lock(&self.installed).clone()
    }

    pub fn is_installed(&self, hash: &str) -> bool {
        lock(&self.installed).contains_key(hash)
    }

    /// The partition named `env`, created on first use.
    pub fn partition(&self, env: &str) -> Arc<Partition> {
        if let Some(existing) = self.existing_partition(env) {
            return existing;
        }
        let mut partitions = self
            .partitions
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        partitions
            .entry(env.to_string())
            .or_insert_with(|| Arc::new(Partition::new(env)))
            .clone()
    }

    pub fn existing_partition(&self, env: &str) -> Option<Arc<Partition>> {
        self.partitions
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(env)
            .cloned()
    }

    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Store `value` under `key` in partition `env`, moving it out of any other partition.
    pub fn put(&self, key: &str, value: Value, resource_type: &str, env: &str) {
        let mut index = lock(&self.index);
        let target = self.partition(env);
        if let Some(previous) = index.get(key).filter(|previous| previous.as_str() != env) {
            if let Some(old) = self.existing_partition(previous) {
                lock(&old.objects).remove(key);
            }
        }
        lock(&target.objects).insert(
            key.to_string(),
            StoredObject {
                value,
                resource_type: resource_type.to_string(),
            },
        );
        index.insert(key.to_string(), env.to_string());
    }

    /// Look `key` up in `env`, or in whichever partition holds it. `None` means absent.
    pub fn get(&self, key: &str, env: Option<&str>) -> Option<StoredObject> {
        let partition = match env {
            Some(env) => self.existing_partition(env)?,
            None => {
                let index = lock(&self.index);
                let owner = index.get(key)?;
                self.existing_partition(owner)?
            }
        };
        lock(&partition.objects).get(key).cloned()
    }

    /// Partition holding `key`, if any.
    pub fn owner_of(&self, key: &str) -> Option<String> {
        lock(&self.index).get(key).cloned()
    }

    pub fn keys(&self, env: Option<&str>) -> Vec<String> {
        match env {
            Some(env) => self
                .existing_partition(env)
                .map(|partition| lock(&partition.objects).keys().cloned().collect())
                .unwrap_or_default(),
            None => lock(&self.index).keys().cloned().collect(),
        }
    }

    /// Delete a whole partition when `key` names one that is not itself an object
    /// stored elsewhere, otherwise the single object. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        let names_partition = self.owner_of(key).is_none_or(|owner| owner == key);
        if names_partition && self.existing_partition(key).is_some() {
            return self.delete_env(key);
        }
        let mut index = lock(&self.index);
        let Some(owner) = index.remove(key) else {
            return false;
        };
        if let Some(partition) = self.existing_partition(&owner) {
            lock(&partition.objects).remove(key);
        }
        true
    }

    /// Drop partition `env` and every object in it. Other partitions are untouched.
    pub fn delete_env(&self, env: &str) -> bool {
        let mut index = lock(&self.index);
        let removed = self
            .partitions
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(env);
        let Some(partition) = removed else {
            return false;
        };
        for key in lock(&partition.objects).keys() {
            if index.get(key).is_some_and(|owner| owner == env) {
                index.remove(key);
            }
        }
        debug!(env, "environment partition deleted");
        true
    }

    pub fn set_env_vars(&self, env: &str, vars: BTreeMap<String, String>) {
        let partition = self.partition(env);
        lock(&partition.env_vars).extend(vars);
    }

    pub fn env_vars(&self, env: &str) -> BTreeMap<String, String> {
        self.existing_partition(env)
            .map(|partition| partition.env_vars())
            .unwrap_or_default()
    }

    pub fn put_secret(&self, env: &str, secret: Secret) {
        let partition = self.partition(env);
        lock(&partition.secrets).insert(secret.name.clone(), secret);
    }

    /// Record an in-flight call of `key` in `env` until the guard drops. Calls in an env
    /// with no partition are tracked on a detached one and never create it.
    pub fn begin_call(&self, env: &str, key: &str, kind: CallKind) -> Result<ActiveCallGuard, Error> {
        let partition = self
            .existing_partition(env)
            .unwrap_or_else(|| Arc::new(Partition::new(env)));
        let id = new_call_id()?;
        let started = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        lock(&partition.active)
            .entry(key.to_string())
            .or_default()
            .push(ActiveCall {
                id: id.clone(),
                kind,
                started,
            });
        Ok(ActiveCallGuard {
            partition,
            key: key.to_string(),
            id,
        })
    }
}

pub fn new_call_id() -> Result<String, Error> {
    let mut bytes = [0u8; 12];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("failed to generate call id: {err}"))
    })?;
    Ok(hex_encode(&bytes))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

#[cfg(test)]
mod tests {
    use super::{ENV_RESOURCE_TYPE, OBJECT_RESOURCE_TYPE, Registry, new_call_id};
    use crate::core::envelope::CallKind;
    use crate::core::environment::Secret;
    use crate::core::error::{Error, ErrorKind};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn partitions_are_isolated() {
        let registry = Registry::new();
        registry.put("a1", json!(1), OBJECT_RESOURCE_TYPE, "A");
        registry.put("b1", json!(2), OBJECT_RESOURCE_TYPE, "B");
        assert!(registry.get("a1", Some("B")).is_none());
        assert_eq!(registry.keys(Some("B")), vec!["b1".to_string()]);
        assert!(registry.delete("B"));
        assert_eq!(registry.get("a1", Some("A")).map(|o| o.value), Some(json!(1)));
        assert!(registry.get("b1", None).is_none());
    }

    #[test]
    fn deleting_env_partition_keeps_siblings() {
        let registry = Registry::new();
        registry.put("env1", json!({}), ENV_RESOURCE_TYPE, "env1");
        registry.put("k1", json!("v1"), OBJECT_RESOURCE_TYPE, "env1");
        registry.put("env2", json!({}), ENV_RESOURCE_TYPE, "env2");
        registry.put("k2", json!("v2"), OBJECT_RESOURCE_TYPE, "env2");
        registry.put("env3", json!({}), ENV_RESOURCE_TYPE, "env1");

        assert!(registry.delete("env2"));
        assert!(registry.get("env2", None).is_none());
        assert!(registry.get("k2", None).is_none());
        assert!(registry.get("k1", None).is_some());

        assert!(registry.delete("env3"));
        assert!(registry.get("env3", None).is_none());
        assert!(registry.get("env1", None).is_some());
        assert!(registry.get("k1", None).is_some());
        assert!(!registry.delete("env3"));
    }

    #[test]
    fn deleting_env_object_ignores_same_named_partition() {
        let registry = Registry::new();
        registry.put("env1", json!({}), ENV_RESOURCE_TYPE, "env1");
        registry.put("env3", json!({}), ENV_RESOURCE_TYPE, "env1");
        registry.set_env_vars("env3", [("MODE".to_string(), "x".to_string())].into());

        assert!(registry.delete("env3"));
        assert!(registry.get("env3", None).is_none());
        assert!(registry.get("env1", Some("env1")).is_some());
    }

    #[test]
    fn calls_in_unknown_envs_leave_no_partition() {
        let registry = Registry::new();
        let guard = registry
            .begin_call("ghost-env", "fn", CallKind::Call)
            .expect("begin");
        assert!(registry.existing_partition("ghost-env").is_none());
        drop(guard);
        assert!(registry.partitions().is_empty());
    }

    #[test]
    fn keys_are_unique_node_wide() {
        let registry = Registry::new();
        registry.put("k", json!(1), OBJECT_RESOURCE_TYPE, "A");
        registry.put("k", json!(2), OBJECT_RESOURCE_TYPE, "B");
        assert!(registry.get("k", Some("A")).is_none());
        assert_eq!(registry.get("k", None).map(|o| o.value), Some(json!(2)));
        assert_eq!(registry.owner_of("k").as_deref(), Some("B"));
        assert_eq!(registry.keys(None), vec!["k".to_string()]);
    }

    #[test]
    fn install_once_is_single_flight() {
        let registry = Arc::new(Registry::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..4 {
            let registry = Arc::clone(&registry);
            let runs = Arc::clone(&runs);
            handles.push(thread::spawn(move || {
                registry.install_once("hash", &format!("env{i}"), false, || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    Ok(())
                })
            }));
        }
        for handle in handles {
            handle.join().expect("join").expect("install");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(registry.installed_envs().len(), 1);
    }

    #[test]
    fn failed_install_leaves_hash_unrecorded() {
        let registry = Registry::new();
        let err = registry
            .install_once("h", "e", false, || {
                Err(Error::new(ErrorKind::Install).with_message("boom"))
            })
            .expect_err("fails");
        assert_eq!(err.kind(), ErrorKind::Install);
        assert!(!registry.is_installed("h"));
        assert!(registry.install_once("h", "e", false, || Ok(())).expect("retry"));
    }

    #[test]
    fn active_calls_clear_on_drop() {
        let registry = Registry::new();
        let partition = registry.partition("env");
        let guard = registry
            .begin_call("env", "fn", CallKind::Remote)
            .expect("begin");
        let calls = partition.active_calls("fn");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, guard.id());
        drop(guard);
        assert!(partition.active_calls("fn").is_empty());
    }

    #[test]
    fn secrets_reach_process_env_only() {
        let registry = Registry::new();
        let mut values = std::collections::BTreeMap::new();
        values.insert("TOKEN".to_string(), "s3cret".to_string());
        registry.put_secret("env", Secret::new("creds", values));
        let partition = registry.partition("env");
        assert_eq!(partition.secret_names(), vec!["creds".to_string()]);
        assert_eq!(
            partition.process_env().get("TOKEN").map(String::as_str),
            Some("s3cret")
        );
        assert!(registry.keys(None).is_empty());
    }

    #[test]
    fn call_ids_are_hex() {
        let id = new_call_id().expect("id");
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
