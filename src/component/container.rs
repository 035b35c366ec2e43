use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::component::provider::Provider;
use crate::component::types::{ComponentError, DynService};
use crate::component::Component;

/// Per-app registry of providers, one per component name.
#[derive(Clone)]
pub struct ComponentContainer {
    pub(crate) inner: Arc<ComponentContainerInner>,
}

pub(crate) struct ComponentContainerInner {
    name: Arc<str>,
    providers: Mutex<HashMap<String, Provider>>,
    root_service: Mutex<Option<DynService>>,
}

impl ComponentContainer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ComponentContainerInner {
                name: Arc::from(name.into()),
                providers: Mutex::new(HashMap::new()),
                root_service: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add_component(&self, component: Component) -> Result<(), ComponentError> {
        self.get_provider(component.name()).set_component(component)
    }

    /// Replaces the provider of `component`'s name, dropping its instances.
    pub fn add_or_overwrite_component(&self, component: Component) -> Result<(), ComponentError> {
        let previous = self.lock_providers().remove(component.name());
        if let Some(previous) = previous {
            previous.delete();
        }
        self.add_component(component)
    }

    /// Returns the provider for `name`, creating an empty one when the
    /// component has not been registered yet.
    pub fn get_provider(&self, name: &str) -> Provider {
        let mut providers = self.lock_providers();
        providers
            .entry(name.to_string())
            .or_insert_with(|| Provider::new(name, self))
            .clone()
    }

    pub fn get_providers(&self) -> Vec<Provider> {
        self.lock_providers().values().cloned().collect()
    }

    /// Attaches the service factories can reach through `root_service`,
    /// normally the owning app.
    pub fn attach_root_service(&self, service: DynService) {
        *lock(&self.inner.root_service) = Some(service);
    }

    pub fn detach_root_service(&self) {
        lock(&self.inner.root_service).take();
    }

    pub fn root_service<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let service = lock(&self.inner.root_service).clone()?;
        service.downcast::<T>().ok()
    }

    fn lock_providers(&self) -> MutexGuard<'_, HashMap<String, Provider>> {
        lock(&self.inner.providers)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
