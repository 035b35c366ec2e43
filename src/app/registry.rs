use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

use crate::app::types::FirebaseApp;
use crate::component::{self, Component, Provider, DEFAULT_ENTRY_NAME};

static APPS: LazyLock<Mutex<HashMap<String, FirebaseApp>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

pub(crate) fn apps_guard() -> MutexGuard<'static, HashMap<String, FirebaseApp>> {
    APPS.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Attaches a component to `app`, logging failures.
pub(crate) fn add_component(app: &FirebaseApp, component: &Component) {
    if let Err(err) = app.container().add_component(component.clone()) {
        log::debug!("component {} failed to register with app {}: {err}", component.name(), app.name());
    }
}

/// Registers a component globally and attaches it to the apps that already
/// exist. Returns `false` when the name is taken.
pub fn register_component(component: Component) -> bool {
    if !component::register_component(component.clone()) {
        return false;
    }
    let apps: Vec<FirebaseApp> = apps_guard().values().cloned().collect();
    for app in &apps {
        add_component(app, &component);
    }
    true
}

pub fn get_provider(app: &FirebaseApp, name: &str) -> Provider {
    app.container().get_provider(name)
}

/// Drops a cached service so the next lookup creates a fresh one.
pub fn remove_service_instance(app: &FirebaseApp, name: &str, instance_identifier: Option<&str>) {
    get_provider(app, name).clear_instance(instance_identifier.unwrap_or(DEFAULT_ENTRY_NAME));
}
