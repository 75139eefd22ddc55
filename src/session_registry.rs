use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::config::InterpreterConfig;
use crate::error::KernelError;
use crate::execution::{BOOTSTRAP_PREAMBLE, ExecutionRequest, submit};
use crate::kernel_launcher::{KernelSession, launch};

pub type SharedSession = Arc<tokio::sync::Mutex<KernelSession>>;

/// Owner-keyed cells filled at most once each. Concurrent first calls for one owner share a
/// single initialization; a failed one leaves the cell empty so the next call retries.
struct SessionSlots<T> {
    slots: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T: Clone> SessionSlots<T> {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_try_init<F, Fut, E>(&self, owner_id: &str, init: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let slot = Arc::clone(self.lock().entry(owner_id.to_string()).or_default());
        slot.get_or_try_init(init).await.cloned()
    }

    fn initialized_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Empties the map and returns whatever had been initialized.
    fn take_all(&self) -> Vec<(String, T)> {
        self.lock()
            .drain()
            .filter_map(|(owner_id, slot)| slot.get().cloned().map(|value| (owner_id, value)))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<OnceCell<T>>>> {
        // Entries are plain handles, so a poisoned map is still consistent.
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// At most one kernel per owner id for the registry's lifetime.
pub struct KernelRegistry {
    config: Arc<InterpreterConfig>,
    sessions: SessionSlots<SharedSession>,
}

impl KernelRegistry {
    pub fn new(config: Arc<InterpreterConfig>) -> Self {
        Self {
            config,
            sessions: SessionSlots::new(),
        }
    }

    /// Returns the owner's session, launching and bootstrapping it on first use.
    pub async fn get_or_create(&self, owner_id: &str) -> Result<SharedSession, KernelError> {
        self.sessions
            .get_or_try_init(owner_id, || async {
                let mut session = launch(owner_id, &self.config).await?;
                self.bootstrap(&mut session).await;
                Ok::<_, KernelError>(Arc::new(tokio::sync::Mutex::new(session)))
            })
            .await
    }

    pub fn session_count(&self) -> usize {
        self.sessions.initialized_count()
    }

    /// Sends every kernel a shutdown request and reaps it. The registry is empty afterwards.
    pub async fn shutdown_all(&self) {
        tracing::debug!(kernels = self.session_count(), "shutting down kernels");
        let sessions = self.sessions.take_all();
        for (owner_id, session) in sessions {
            let mut session = session.lock().await;
            tracing::debug!(owner_id = %owner_id, pid = session.pid(), "shutting down kernel");
            session.shutdown().await;
        }
    }

    async fn bootstrap(&self, session: &mut KernelSession) {
        let request = ExecutionRequest::new(BOOTSTRAP_PREAMBLE);
        let result = submit(session, &request, &self.config).await;
        if result.is_empty() {
            tracing::info!(owner_id = session.owner_id(), "kernel bootstrap finished");
        } else {
            tracing::info!(
                owner_id = session.owner_id(),
                output = %result.render(),
                "kernel bootstrap finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn registry_without_python(workspace: &std::path::Path) -> KernelRegistry {
        let config = InterpreterConfig {
            python_program: PathBuf::from("/nonexistent/python-for-tests"),
            ..InterpreterConfig::default()
        }
        .with_workspace_root(workspace);
        KernelRegistry::new(Arc::new(config))
    }

    #[tokio::test]
    async fn failed_launch_is_not_cached() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry_without_python(temp.path());

        assert!(registry.get_or_create("owner").await.is_err());
        assert_eq!(registry.session_count(), 0);
        assert!(registry.get_or_create("owner").await.is_err());
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_all_empties_registry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = registry_without_python(temp.path());
        let _ = registry.get_or_create("a").await;
        let _ = registry.get_or_create("b").await;

        registry.shutdown_all().await;
        assert!(registry.sessions.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_calls_share_one_creation() {
        let slots = Arc::new(SessionSlots::<Arc<String>>::new());
        let launches = Arc::new(AtomicUsize::new(0));

        let racers: Vec<_> = (0..8)
            .map(|_| {
                let slots = Arc::clone(&slots);
                let launches = Arc::clone(&launches);
                tokio::spawn(async move {
                    slots
                        .get_or_try_init("x", || async {
                            launches.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, KernelError>(Arc::new("kernel".to_string()))
                        })
                        .await
                })
            })
            .collect();

        let mut sessions = Vec::new();
        for racer in racers {
            sessions.push(racer.await.expect("join").expect("created"));
        }
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert!(sessions.iter().all(|session| Arc::ptr_eq(session, &sessions[0])));
        assert_eq!(slots.initialized_count(), 1);
    }

    #[tokio::test]
    async fn owners_get_separate_creations_and_failures_retry() {
        let slots = SessionSlots::<Arc<String>>::new();
        let launches = AtomicUsize::new(0);
        let create = |owner: &'static str| {
            let launches = &launches;
            move || async move {
                launches.fetch_add(1, Ordering::SeqCst);
                Ok::<_, KernelError>(Arc::new(owner.to_string()))
            }
        };

        let failed = slots
            .get_or_try_init("b", || async {
                launches.fetch_add(1, Ordering::SeqCst);
                Err::<Arc<String>, _>(KernelError::ChannelClosed("shell"))
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(slots.initialized_count(), 0);

        let a = slots.get_or_try_init("a", create("a")).await.expect("a");
        let b = slots.get_or_try_init("b", create("b")).await.expect("b");
        let a_again = slots.get_or_try_init("a", create("a")).await.expect("a again");
        assert_eq!(launches.load(Ordering::SeqCst), 3);
        assert!(Arc::ptr_eq(&a, &a_again));
        assert_eq!(b.as_str(), "b");

        let drained = slots.take_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(slots.initialized_count(), 0);
    }
}
