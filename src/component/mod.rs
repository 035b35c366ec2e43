//! Dependency-injection container shared by the services of an app.
//!
//! Components are registered globally and attached to every app's
//! [`ComponentContainer`]. Each container hands out instances through a
//! [`Provider`] per component name.

mod component;
pub mod container;
pub mod provider;
pub mod types;

pub use component::Component;
pub use container::ComponentContainer;
pub use provider::Provider;
pub use types::{
    ComponentError, ComponentType, DynService, InstanceFactory, InstanceFactoryOptions, InstantiationMode,
};

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

/// Identifier of the default app and of default service instances.
pub const DEFAULT_ENTRY_NAME: &str = "[DEFAULT]";

static GLOBAL_COMPONENTS: LazyLock<Mutex<HashMap<String, Component>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

pub(crate) fn global_components() -> MutexGuard<'static, HashMap<String, Component>> {
    container::lock(&GLOBAL_COMPONENTS)
}

/// Adds `component` to the global list attached to new apps. Returns `false`
/// when a component with the same name is already registered.
pub fn register_component(component: Component) -> bool {
    let mut components = global_components();
    if components.contains_key(component.name()) {
        return false;
    }
    components.insert(component.name().to_string(), component);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_component(name: &str, counter: Arc<AtomicUsize>) -> Component {
        let factory: InstanceFactory = Arc::new(move |_container, _options| {
            Ok(Arc::new(counter.fetch_add(1, Ordering::SeqCst) + 1) as DynService)
        });
        Component::new(name, factory, ComponentType::Public)
    }

    #[test]
    fn set_component_rejects_mismatched_name() {
        let container = ComponentContainer::new("test");
        let provider = container.get_provider("foo");
        let component = counting_component("bar", Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            provider.set_component(component),
            Err(ComponentError::MismatchingComponent { .. })
        ));
    }

    #[test]
    fn lazy_component_is_created_once() {
        let container = ComponentContainer::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        container
            .add_component(counting_component("foo", Arc::clone(&counter)))
            .unwrap();
        let provider = container.get_provider("foo");
        assert!(!provider.is_initialized(None));
        assert_eq!(provider.get_immediate::<usize>().map(|v| *v), Some(1));
        assert_eq!(provider.get_immediate::<usize>().map(|v| *v), Some(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eager_component_initializes_immediately() {
        let container = ComponentContainer::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        let component = counting_component("foo", Arc::clone(&counter))
            .with_instantiation_mode(InstantiationMode::Eager);
        container.add_component(component).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(container.get_provider("foo").is_initialized(None));
    }

    #[test]
    fn explicit_component_requires_initialize() {
        let container = ComponentContainer::new("test");
        let factory: InstanceFactory = Arc::new(|_container, options| Ok(Arc::new(options.options) as DynService));
        let component =
            Component::new("foo", factory, ComponentType::Public).with_instantiation_mode(InstantiationMode::Explicit);
        container.add_component(component).unwrap();
        let provider = container.get_provider("foo");
        assert!(provider.get_immediate::<Value>().is_none());

        let options = json!({"value": true});
        let instance = provider.initialize::<Value>(options.clone(), None).unwrap();
        assert_eq!(*instance, options);
        assert_eq!(provider.get_options(None), options);
        assert!(matches!(
            provider.initialize::<Value>(Value::Null, None),
            Err(ComponentError::InstanceAlreadyInitialized { .. })
        ));
    }

    #[test]
    fn multiple_instances_are_keyed_by_identifier() {
        let container = ComponentContainer::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        let component = counting_component("db", Arc::clone(&counter)).with_multiple_instances(true);
        container.add_component(component).unwrap();
        let provider = container.get_provider("db");
        let first = provider.get_immediate_with_options::<usize>(Some("a"), false).unwrap();
        let second = provider.get_immediate_with_options::<usize>(Some("b"), false).unwrap();
        assert_ne!(first, second);
        assert!(provider.is_initialized(Some("a")));
        assert!(!provider.is_initialized(None));
    }

    #[test]
    fn delete_runs_deletion_callback() {
        let container = ComponentContainer::new("test");
        let deleted = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&deleted);
        let component = counting_component("foo", Arc::new(AtomicUsize::new(0))).with_instance_deleted_callback(
            move |_instance| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );
        container.add_component(component).unwrap();
        let provider = container.get_provider("foo");
        provider.get_immediate::<usize>().unwrap();
        provider.delete();
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
        assert!(!provider.is_initialized(None));
    }

    #[test]
    fn overwrite_replaces_provider() {
        let container = ComponentContainer::new("test");
        let counter = Arc::new(AtomicUsize::new(0));
        container
            .add_component(counting_component("foo", Arc::clone(&counter)))
            .unwrap();
        assert_eq!(container.get_provider("foo").get_immediate::<usize>().map(|v| *v), Some(1));

        let replacement: InstanceFactory = Arc::new(|_container, _options| Ok(Arc::new(99usize) as DynService));
        container
            .add_or_overwrite_component(Component::new("foo", replacement, ComponentType::Public))
            .unwrap();
        assert_eq!(container.get_provider("foo").get_immediate::<usize>().map(|v| *v), Some(99));
    }
}
