//! Function profile registry.
//!
//! Holds the current map of function name → profile. The whole set is
//! replaced atomically on every push; readers clone the `Arc` they need
//! for the duration of one decision and never observe a partial update.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::{info, warn};

use silt_core::WorkerDefaults;

use crate::error::ProfileError;
use crate::types::FunctionProfile;

/// Whether `set` waits for the preset hook (code pre-fetch) to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Immediately,
    Wait,
}

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Invoked with the freshly committed profile set; used to pre-fetch
/// function code before workers are launched against it.
pub type PresetHook =
    Box<dyn Fn(Vec<Arc<FunctionProfile>>, ApplyMode) -> BoxFuture + Send + Sync>;

struct RegistryInner {
    profiles: RwLock<HashMap<String, Arc<FunctionProfile>>>,
    defaults: WorkerDefaults,
    changed_tx: watch::Sender<u64>,
    preset: RwLock<Option<PresetHook>>,
}

/// Shared handle to the profile map.
#[derive(Clone)]
pub struct ProfileRegistry {
    inner: Arc<RegistryInner>,
}

impl ProfileRegistry {
    pub fn new(defaults: WorkerDefaults) -> Self {
        let (changed_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                profiles: RwLock::new(HashMap::new()),
                defaults,
                changed_tx,
                preset: RwLock::new(None),
            }),
        }
    }

    /// Install the preset hook invoked after every commit.
    pub fn set_preset_hook(&self, hook: PresetHook) {
        *self.inner.preset.write().expect("lock poisoned") = Some(hook);
    }

    /// Replace the full profile set.
    ///
    /// Validates every profile, fills unset worker fields from the config
    /// defaults, commits the map atomically and emits `changed`. The preset
    /// hook then runs: `Wait` resolves only after it completes, and its
    /// error surfaces; `Immediately` resolves right away with the hook
    /// running in the background.
    pub async fn set(
        &self,
        profiles: Vec<FunctionProfile>,
        mode: ApplyMode,
    ) -> Result<(), ProfileError> {
        let mut map = HashMap::with_capacity(profiles.len());
        for mut profile in profiles {
            validate(&profile)?;
            profile.normalize(&self.inner.defaults);
            if map
                .insert(profile.name.clone(), Arc::new(profile))
                .is_some()
            {
                return Err(ProfileError::InvalidProfile(
                    "duplicate function name".to_string(),
                ));
            }
        }

        let count = map.len();
        {
            let mut profiles = self.inner.profiles.write().expect("lock poisoned");
            *profiles = map;
        }
        self.inner.changed_tx.send_modify(|generation| *generation += 1);
        info!(count, "function profiles replaced");

        let hook_future = {
            let preset = self.inner.preset.read().expect("lock poisoned");
            preset.as_ref().map(|hook| hook(self.get_all(), mode))
        };
        if let Some(future) = hook_future {
            match mode {
                ApplyMode::Wait => future.await.map_err(ProfileError::Preset)?,
                ApplyMode::Immediately => {
                    tokio::spawn(async move {
                        if let Err(e) = future.await {
                            warn!(error = %e, "profile preset hook failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<FunctionProfile>> {
        self.inner.profiles.read().expect("lock poisoned").get(name).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<FunctionProfile>> {
        self.inner.profiles.read().expect("lock poisoned").values().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.profiles.read().expect("lock poisoned").contains_key(name)
    }

    /// Generation counter bumped on every commit.
    pub fn subscribe_changed(&self) -> watch::Receiver<u64> {
        self.inner.changed_tx.subscribe()
    }

    pub fn defaults(&self) -> &WorkerDefaults {
        &self.inner.defaults
    }
}

fn validate(profile: &FunctionProfile) -> Result<(), ProfileError> {
    if profile.name.is_empty() {
        return Err(ProfileError::InvalidProfile(
            "function name must not be empty".to_string(),
        ));
    }
    if profile.runtime.is_empty() {
        return Err(ProfileError::InvalidProfile(format!(
            "{}: runtime must not be empty",
            profile.name
        )));
    }
    if profile.resource_limit.memory_bytes == 0 {
        return Err(ProfileError::InvalidProfile(format!(
            "{}: memory limit must be positive",
            profile.name
        )));
    }
    if profile.resource_limit.cpu_fraction <= 0.0 {
        return Err(ProfileError::InvalidProfile(format!(
            "{}: cpu fraction must be positive",
            profile.name
        )));
    }
    for option in &profile.worker.v8_options {
        if !option.starts_with("--") {
            return Err(ProfileError::InvalidV8Option {
                function: profile.name.clone(),
                option: option.clone(),
            });
        }
    }
    Ok(())
}
