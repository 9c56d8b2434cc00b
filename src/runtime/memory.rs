//! In-memory container runtime for tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::security::SecurityTier;

use super::{ContainerConfig, ContainerInfo, ContainerRuntime, ContainerState, ImageBuildSpec};

#[derive(Debug, Clone)]
struct FakeContainer {
    info: ContainerInfo,
    config: Option<ContainerConfig>,
}

#[derive(Debug, Default)]
struct State {
    containers: BTreeMap<String, FakeContainer>,
    images: HashSet<String>,
    fail_create_tiers: HashSet<SecurityTier>,
    fail_start_tiers: HashSet<SecurityTier>,
    fail_remove: HashSet<String>,
    next_id: u64,
}

/// Deterministic [`ContainerRuntime`] with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    state: Mutex<State>,
    builds: AtomicUsize,
    build_delay: Mutex<Duration>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an existing image.
    pub fn add_image(&self, image: impl Into<String>) {
        self.lock().images.insert(image.into());
    }

    /// Makes `create_container` fail whenever the security tier is `tier`.
    pub fn fail_create_at(&self, tier: SecurityTier) {
        self.lock().fail_create_tiers.insert(tier);
    }

    /// Makes `start_container` fail for containers created at `tier`.
    pub fn fail_start_at(&self, tier: SecurityTier) {
        self.lock().fail_start_tiers.insert(tier);
    }

    /// Makes `remove_container` fail for `id`.
    pub fn fail_remove_of(&self, id: impl Into<String>) {
        self.lock().fail_remove.insert(id.into());
    }

    /// Delays every image build, so concurrent builds overlap.
    pub fn set_build_delay(&self, delay: Duration) {
        *self
            .build_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    /// Inserts a container that this runtime did not create, as if left
    /// behind by an earlier process.
    pub fn insert_container(
        &self,
        name: impl Into<String>,
        state: ContainerState,
        labels: BTreeMap<String, String>,
    ) -> String {
        let mut st = self.lock();
        let id = Self::allocate_id(&mut st);
        st.containers.insert(
            id.clone(),
            FakeContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: name.into(),
                    image: String::new(),
                    state,
                    labels,
                },
                config: None,
            },
        );
        id
    }

    /// Number of image builds actually performed.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Returns true if a container with `id` exists.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().containers.contains_key(id)
    }

    /// Number of containers currently present.
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Returns the config a container was created with.
    pub fn config_of(&self, id: &str) -> Option<ContainerConfig> {
        self.lock().containers.get(id).and_then(|c| c.config.clone())
    }

    /// Returns the state of `id` without a context, for assertions.
    pub fn state_of(&self, id: &str) -> Option<ContainerState> {
        self.lock().containers.get(id).map(|c| c.info.state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn allocate_id(st: &mut State) -> String {
        st.next_id += 1;
        format!("fake{:08x}", st.next_id)
    }

    fn transition(
        &self,
        id: &str,
        f: impl FnOnce(&mut ContainerInfo) -> Result<()>,
    ) -> Result<()> {
        let mut st = self.lock();
        let container = st
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        f(&mut container.info)
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn create_container(&self, ctx: &OpContext, config: &ContainerConfig) -> Result<String> {
        ctx.check()?;
        let mut st = self.lock();

        if st.fail_create_tiers.contains(&config.security.tier) {
            return Err(Error::ContainerCreate(format!(
                "injected create failure at {}",
                config.security.tier
            )));
        }
        if st.containers.values().any(|c| c.info.name == config.name) {
            return Err(Error::ContainerCreate(format!(
                "name {} already in use",
                config.name
            )));
        }

        let id = Self::allocate_id(&mut st);
        st.containers.insert(
            id.clone(),
            FakeContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: config.name.clone(),
                    image: config.image.clone(),
                    state: ContainerState::Created,
                    labels: config.labels.clone(),
                },
                config: Some(config.clone()),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        ctx.check()?;
        let mut st = self.lock();
        let fail_tiers = st.fail_start_tiers.clone();
        let container = st
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        if let Some(config) = &container.config {
            if fail_tiers.contains(&config.security.tier) {
                return Err(Error::ContainerStart {
                    id: id.to_string(),
                    reason: format!("injected start failure at {}", config.security.tier),
                });
            }
        }
        container.info.state = ContainerState::Running;
        Ok(())
    }

    async fn stop_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        ctx.check()?;
        self.transition(id, |info| {
            info.state = ContainerState::Exited;
            Ok(())
        })
    }

    async fn pause_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        ctx.check()?;
        self.transition(id, |info| match info.state {
            ContainerState::Running => {
                info.state = ContainerState::Paused;
                Ok(())
            }
            other => Err(Error::Runtime(format!("container {} is {}", info.id, other))),
        })
    }

    async fn unpause_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        ctx.check()?;
        self.transition(id, |info| match info.state {
            ContainerState::Paused => {
                info.state = ContainerState::Running;
                Ok(())
            }
            other => Err(Error::Runtime(format!("container {} is {}", info.id, other))),
        })
    }

    async fn remove_container(&self, ctx: &OpContext, id: &str) -> Result<()> {
        ctx.check()?;
        let mut st = self.lock();
        if st.fail_remove.contains(id) {
            return Err(Error::Runtime(format!("injected remove failure for {}", id)));
        }
        st.containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    async fn get_container_state(&self, ctx: &OpContext, id: &str) -> Result<ContainerState> {
        ctx.check()?;
        self.state_of(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }

    async fn list_containers(&self, ctx: &OpContext, name_prefix: &str) -> Result<Vec<ContainerInfo>> {
        ctx.check()?;
        Ok(self
            .lock()
            .containers
            .values()
            .filter(|c| c.info.name.starts_with(name_prefix))
            .map(|c| c.info.clone())
            .collect())
    }

    async fn image_exists(&self, ctx: &OpContext, image: &str) -> Result<bool> {
        ctx.check()?;
        Ok(self.lock().images.contains(image))
    }

    async fn build_image(&self, ctx: &OpContext, spec: &ImageBuildSpec) -> Result<()> {
        let delay = *self
            .build_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.builds.fetch_add(1, Ordering::SeqCst);
        ctx.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await?;
        self.add_image(spec.image.clone());
        Ok(())
    }
}
