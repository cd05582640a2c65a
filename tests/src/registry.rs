use mirto::{Discovery, Registrar, ServiceInstance, Watcher};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::watch;

/// An in-process service registry, shared by the apps and channels of a test.
///
/// Cloning gives another handle to the same registry.
#[derive(Clone)]
pub struct InMemoryRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    services: Mutex<HashMap<String, Vec<ServiceInstance>>>,
    changes: watch::Sender<u64>,
    fail_registration: AtomicBool,
    fail_deregistration: AtomicBool,
    registrations: AtomicUsize,
    deregistrations: AtomicUsize,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                services: Mutex::new(HashMap::new()),
                changes,
                fail_registration: AtomicBool::new(false),
                fail_deregistration: AtomicBool::new(false),
                registrations: AtomicUsize::new(0),
                deregistrations: AtomicUsize::new(0),
            }),
        }
    }
}

impl InMemoryRegistry {
    /// The instances currently registered under `name`.
    pub fn instances(&self, name: &str) -> Vec<ServiceInstance> {
        self.inner
            .services
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Publish an instance without going through an app.
    pub fn add(&self, instance: ServiceInstance) {
        self.update(&instance.name.clone(), |instances| {
            instances.retain(|existing| existing.id != instance.id);
            instances.push(instance);
        });
    }

    /// Remove an instance without going through an app.
    pub fn remove(&self, name: &str, id: &str) {
        self.update(name, |instances| {
            instances.retain(|existing| existing.id != id)
        });
    }

    /// Make every following `register` call fail.
    pub fn fail_registration(&self, fail: bool) {
        self.inner.fail_registration.store(fail, Ordering::SeqCst);
    }

    /// Make every following `deregister` call fail.
    pub fn fail_deregistration(&self, fail: bool) {
        self.inner.fail_deregistration.store(fail, Ordering::SeqCst);
    }

    /// How many registrations succeeded.
    pub fn registrations(&self) -> usize {
        self.inner.registrations.load(Ordering::SeqCst)
    }

    /// How many deregistrations succeeded.
    pub fn deregistrations(&self) -> usize {
        self.inner.deregistrations.load(Ordering::SeqCst)
    }

    fn update<F>(&self, name: &str, change: F)
    where
        F: FnOnce(&mut Vec<ServiceInstance>),
    {
        change(
            self.inner
                .services
                .lock()
                .entry(name.to_string())
                .or_default(),
        );
        self.inner.changes.send_modify(|version| *version += 1);
    }
}

#[async_trait::async_trait]
impl Registrar for InMemoryRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), anyhow::Error> {
        if self.inner.fail_registration.load(Ordering::SeqCst) {
            anyhow::bail!("registry refused instance {}", instance.id);
        }
        self.add(instance.clone());
        self.inner.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), anyhow::Error> {
        if self.inner.fail_deregistration.load(Ordering::SeqCst) {
            anyhow::bail!("registry refused to forget instance {}", instance.id);
        }
        self.remove(&instance.name, &instance.id);
        self.inner.deregistrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Discovery for InMemoryRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>, anyhow::Error> {
        Ok(self.instances(name))
    }

    async fn watch(&self, name: &str) -> Result<Box<dyn Watcher>, anyhow::Error> {
        Ok(Box::new(InMemoryWatcher {
            registry: self.clone(),
            name: name.to_string(),
            changes: self.inner.changes.subscribe(),
            last: None,
            stopped: false,
        }))
    }
}

struct InMemoryWatcher {
    registry: InMemoryRegistry,
    name: String,
    changes: watch::Receiver<u64>,
    last: Option<Vec<ServiceInstance>>,
    stopped: bool,
}

#[async_trait::async_trait]
impl Watcher for InMemoryWatcher {
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, anyhow::Error> {
        if self.stopped {
            anyhow::bail!("watcher has been stopped");
        }

        loop {
            self.changes.borrow_and_update();
            let instances = self.registry.instances(&self.name);
            if self.last.as_ref() != Some(&instances) {
                self.last = Some(instances.clone());
                return Ok(instances);
            }
            self.changes.changed().await?;
        }
    }

    async fn stop(&mut self) -> Result<(), anyhow::Error> {
        self.stopped = true;
        Ok(())
    }
}
