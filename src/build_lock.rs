//! Per-image build locks.
//!
//! Builds of the same image are serialized and deduplicated; builds of
//! different images run concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::context::OpContext;
use crate::error::Result;
use crate::runtime::{ContainerRuntime, ImageBuildSpec};

/// How an image became available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    /// The image existed before any lock was taken.
    AlreadyPresent,
    /// Another caller built it while this one waited for the lock.
    BuiltByOther,
    /// This caller built it.
    Built,
}

/// Registry of lazily created per-image locks.
///
/// The map itself is guarded by a short-held mutex; each image lock is held
/// for the whole build.
#[derive(Debug, Default)]
pub struct BuildLockRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BuildLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `image`, creating it on first use.
    fn lock_for(&self, image: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(image.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits for exclusive build rights on `image`.
    pub async fn acquire(&self, ctx: &OpContext, image: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = self.lock_for(image);
        ctx.run(async move { Ok(lock.lock_owned().await) }).await
    }

    /// Number of images that have had a lock created.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes sure `spec.image` exists, building it at most once across
    /// concurrent callers.
    pub async fn ensure_image<R>(
        &self,
        ctx: &OpContext,
        runtime: &R,
        spec: &ImageBuildSpec,
    ) -> Result<ImageOutcome>
    where
        R: ContainerRuntime + ?Sized,
    {
        if runtime.image_exists(ctx, &spec.image).await? {
            return Ok(ImageOutcome::AlreadyPresent);
        }

        let _guard = self.acquire(ctx, &spec.image).await?;

        // Someone may have finished the build while we waited
        if runtime.image_exists(ctx, &spec.image).await? {
            tracing::debug!(image = %spec.image, "image built by another caller");
            return Ok(ImageOutcome::BuiltByOther);
        }

        tracing::info!(image = %spec.image, "building image");
        runtime.build_image(ctx, spec).await?;
        Ok(ImageOutcome::Built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InMemoryRuntime;
    use std::time::Duration;

    #[tokio::test]
    async fn present_image_skips_lock_and_build() {
        let registry = BuildLockRegistry::new();
        let runtime = InMemoryRuntime::new();
        runtime.add_image("dev:latest");

        let outcome = registry
            .ensure_image(
                &OpContext::new(),
                &runtime,
                &ImageBuildSpec::new("dev:latest", "."),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ImageOutcome::AlreadyPresent);
        assert_eq!(runtime.build_count(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_builds_of_one_image_run_once() {
        let registry = Arc::new(BuildLockRegistry::new());
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.set_build_delay(Duration::from_millis(50));
        let spec = ImageBuildSpec::new("dev:latest", ".");

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                let runtime = runtime.clone();
                let spec = spec.clone();
                tokio::spawn(async move {
                    registry
                        .ensure_image(&OpContext::new(), runtime.as_ref(), &spec)
                        .await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap().unwrap());
        }

        assert_eq!(runtime.build_count(), 1);
        assert!(outcomes.contains(&ImageOutcome::Built));
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, ImageOutcome::Built | ImageOutcome::BuiltByOther)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn distinct_images_build_concurrently() {
        let registry = Arc::new(BuildLockRegistry::new());
        let first = registry.acquire(&OpContext::new(), "a").await.unwrap();

        // A held lock on "a" must not block "b"
        let ctx = OpContext::with_timeout(Duration::from_millis(200));
        let second = registry.acquire(&ctx, "b").await;
        assert!(second.is_ok());
        drop(first);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let registry = BuildLockRegistry::new();
        let ctx = OpContext::new();
        let held = registry.acquire(&ctx, "img").await.unwrap();

        let mut waiting = tokio_test::task::spawn(registry.acquire(&ctx, "img"));
        tokio_test::assert_pending!(waiting.poll());

        drop(held);
        assert!(waiting.is_woken());
        tokio_test::assert_ready_ok!(waiting.poll());
    }

    #[tokio::test]
    async fn waiting_for_a_held_lock_respects_deadline() {
        let registry = BuildLockRegistry::new();
        let _held = registry.acquire(&OpContext::new(), "a").await.unwrap();

        let ctx = OpContext::with_timeout(Duration::from_millis(20));
        let res = registry.acquire(&ctx, "a").await;
        assert!(matches!(res, Err(crate::error::Error::DeadlineExceeded)));
    }
}
