use std::sync::Arc;

use crate::app::errors::{AppError, AppResult};
use crate::app::registry::{self, apps_guard};
use crate::app::types::{FirebaseApp, FirebaseAppConfig, FirebaseAppSettings, FirebaseOptions};
use crate::component::{
    self, Component, ComponentContainer, ComponentError, ComponentType, DynService, InstanceFactory,
    DEFAULT_ENTRY_NAME,
};

pub static SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the component resolving to the app itself.
const APP_COMPONENT_NAME: &str = "app";

fn normalize_name(settings: &FirebaseAppSettings) -> AppResult<String> {
    let name = settings.name.clone().unwrap_or_else(|| DEFAULT_ENTRY_NAME.to_string());
    if name.trim().is_empty() {
        return Err(AppError::BadAppName { app_name: name });
    }
    Ok(name)
}

/// Creates the app named by `settings` (the default app when unnamed) and
/// attaches every registered component to it.
///
/// Initializing an existing name again returns the existing app when
/// options and settings match, and fails with `DuplicateApp` otherwise.
pub fn initialize_app(options: FirebaseOptions, settings: Option<FirebaseAppSettings>) -> AppResult<FirebaseApp> {
    let settings = settings.unwrap_or_default();
    let name = normalize_name(&settings)?;
    if !options.is_defined() {
        return Err(AppError::NoOptions);
    }
    let config = FirebaseAppConfig::new(name.clone(), settings.automatic_data_collection_enabled.unwrap_or(true));

    let app = {
        let mut apps = apps_guard();
        if let Some(existing) = apps.get(&name) {
            if existing.options() == &options && existing.config() == &config {
                return Ok(existing.clone());
            }
            return Err(AppError::DuplicateApp { app_name: name });
        }
        let app = FirebaseApp::new(options, config, ComponentContainer::new(name.clone()));
        apps.insert(name.clone(), app.clone());
        app
    };

    let factory: InstanceFactory = Arc::new(|container: &ComponentContainer, _options| {
        container
            .root_service::<FirebaseApp>()
            .map(|app| app as DynService)
            .ok_or_else(|| ComponentError::InstanceUnavailable {
                name: APP_COMPONENT_NAME.to_string(),
            })
    });
    registry::add_component(&app, &Component::new(APP_COMPONENT_NAME, factory, ComponentType::Private));

    let components: Vec<Component> = component::global_components().values().cloned().collect();
    for component in &components {
        registry::add_component(&app, component);
    }
    log::debug!("initialized app {name}");
    Ok(app)
}

pub fn get_app(name: Option<&str>) -> AppResult<FirebaseApp> {
    let lookup = name.unwrap_or(DEFAULT_ENTRY_NAME);
    apps_guard().get(lookup).cloned().ok_or_else(|| AppError::NoApp {
        app_name: lookup.to_string(),
    })
}

pub fn get_apps() -> Vec<FirebaseApp> {
    apps_guard().values().cloned().collect()
}

/// Removes `app` from the registry and deletes every service it created.
pub fn delete_app(app: &FirebaseApp) -> AppResult<()> {
    let removed = {
        let mut apps = apps_guard();
        match apps.get(app.name()) {
            Some(registered) if registered.ptr_eq(app) => apps.remove(app.name()),
            _ => None,
        }
    };
    if removed.is_none() {
        return app.check_destroyed();
    }

    app.mark_deleted();
    let container = app.container();
    for provider in container.get_providers() {
        provider.delete();
    }
    container.detach_root_service();
    log::debug!("deleted app {}", app.name());
    Ok(())
}
