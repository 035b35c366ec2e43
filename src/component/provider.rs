use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::component::component::Component;
use crate::component::container::{lock, ComponentContainer, ComponentContainerInner};
use crate::component::types::{ComponentError, ComponentType, DynService, InstanceFactoryOptions, InstantiationMode};
use crate::component::DEFAULT_ENTRY_NAME;

/// Hands out the instances of one component within a container.
///
/// Instances are created by the component's factory and cached per
/// identifier. Components without multiple-instance support share the
/// default instance.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    name: Arc<str>,
    container: Weak<ComponentContainerInner>,
    component: Mutex<Option<Component>>,
    instances: Mutex<HashMap<String, (DynService, Value)>>,
}

impl Provider {
    pub(crate) fn new(name: &str, container: &ComponentContainer) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                name: Arc::from(name),
                container: Arc::downgrade(&container.inner),
                component: Mutex::new(None),
                instances: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn component_type(&self) -> Option<ComponentType> {
        self.component().map(|component| component.component_type())
    }

    pub fn is_component_set(&self) -> bool {
        lock(&self.inner.component).is_some()
    }

    pub fn is_initialized(&self, identifier: Option<&str>) -> bool {
        let id = self.normalize_identifier(identifier);
        lock(&self.inner.instances).contains_key(&id)
    }

    /// Options the instance for `identifier` was created with, `Null` when
    /// there is no such instance.
    pub fn get_options(&self, identifier: Option<&str>) -> Value {
        let id = self.normalize_identifier(identifier);
        lock(&self.inner.instances)
            .get(&id)
            .map(|(_, options)| options.clone())
            .unwrap_or(Value::Null)
    }

    /// Forgets the cached instance so the next lookup creates a new one.
    pub fn clear_instance(&self, identifier: &str) {
        let id = self.normalize_identifier(Some(identifier));
        lock(&self.inner.instances).remove(&id);
    }

    /// Drops every instance, running the component's deletion callback for
    /// each of them.
    pub fn delete(&self) {
        let instances: Vec<DynService> = lock(&self.inner.instances)
            .drain()
            .map(|(_, (instance, _))| instance)
            .collect();
        let Some(callback) = self.component().and_then(|component| component.on_instance_deleted) else {
            return;
        };
        for instance in &instances {
            callback(instance);
        }
    }

    /// Default instance, created on demand unless the component is explicit.
    pub fn get_immediate<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync + 'static,
    {
        self.get_immediate_with_options::<T>(None, true).ok().flatten()
    }

    /// Instance for `identifier`. With `optional`, initialization failures
    /// yield `Ok(None)` instead of an error.
    pub fn get_immediate_with_options<T>(
        &self,
        identifier: Option<&str>,
        optional: bool,
    ) -> Result<Option<Arc<T>>, ComponentError>
    where
        T: Any + Send + Sync + 'static,
    {
        match self.get_or_initialize(identifier, Value::Null, false) {
            Ok(service) => Ok(service.and_then(|service| service.downcast::<T>().ok())),
            Err(_) if optional => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Creates the instance for `identifier` with `options`. Fails when it
    /// already exists.
    pub fn initialize<T>(&self, options: Value, identifier: Option<&str>) -> Result<Arc<T>, ComponentError>
    where
        T: Any + Send + Sync + 'static,
    {
        if self.is_initialized(identifier) {
            return Err(ComponentError::InstanceAlreadyInitialized {
                name: self.name().to_string(),
                identifier: identifier.unwrap_or(DEFAULT_ENTRY_NAME).to_string(),
            });
        }

        self.get_or_initialize(identifier, options, true)?
            .and_then(|service| service.downcast::<T>().ok())
            .ok_or_else(|| ComponentError::InstanceUnavailable {
                name: self.name().to_string(),
            })
    }

    pub fn set_component(&self, component: Component) -> Result<(), ComponentError> {
        if component.name() != self.name() {
            return Err(ComponentError::MismatchingComponent {
                expected: self.name().to_string(),
                found: component.name().to_string(),
            });
        }

        {
            let mut slot = lock(&self.inner.component);
            if slot.is_some() {
                return Err(ComponentError::ComponentAlreadyProvided {
                    name: self.name().to_string(),
                });
            }
            *slot = Some(component.clone());
        }

        if component.instantiation_mode() == InstantiationMode::Eager {
            if let Err(err) = self.get_or_initialize(None, Value::Null, true) {
                log::debug!("eager initialization of {} failed: {err}", self.name());
            }
        }
        Ok(())
    }

    fn component(&self) -> Option<Component> {
        lock(&self.inner.component).clone()
    }

    fn get_or_initialize(
        &self,
        identifier: Option<&str>,
        options: Value,
        force: bool,
    ) -> Result<Option<DynService>, ComponentError> {
        let id = self.normalize_identifier(identifier);
        if let Some((instance, _)) = lock(&self.inner.instances).get(&id) {
            return Ok(Some(Arc::clone(instance)));
        }

        let Some(component) = self.component() else {
            return Ok(None);
        };
        if !force && component.instantiation_mode() == InstantiationMode::Explicit {
            return Ok(None);
        }

        let Some(inner) = self.inner.container.upgrade() else {
            return Err(ComponentError::InitializationFailed {
                name: self.name().to_string(),
                reason: "container dropped".to_string(),
            });
        };
        let container = ComponentContainer { inner };

        let factory_options = InstanceFactoryOptions::new(
            (id != DEFAULT_ENTRY_NAME).then(|| id.clone()),
            options.clone(),
        );
        // The factory may look up other providers, so no lock is held here.
        let created = (component.instance_factory)(&container, factory_options).map_err(|err| {
            ComponentError::InitializationFailed {
                name: self.name().to_string(),
                reason: err.to_string(),
            }
        })?;

        let (instance, is_new) = {
            let mut instances = lock(&self.inner.instances);
            match instances.get(&id) {
                Some((existing, _)) => (Arc::clone(existing), false),
                None => {
                    instances.insert(id.clone(), (Arc::clone(&created), options));
                    (created, true)
                }
            }
        };

        if is_new {
            if let Some(callback) = component.on_instance_created.as_ref() {
                callback(&container, &id, &instance);
            }
        }
        Ok(Some(instance))
    }

    fn normalize_identifier(&self, identifier: Option<&str>) -> String {
        let multiple = lock(&self.inner.component)
            .as_ref()
            .is_some_and(|component| component.multiple_instances());
        match identifier {
            Some(id) if multiple => id.to_string(),
            _ => DEFAULT_ENTRY_NAME.to_string(),
        }
    }
}
