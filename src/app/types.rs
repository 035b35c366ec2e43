use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::app::errors::{AppError, AppResult};
use crate::component::{Component, ComponentContainer, DynService};

/// Project configuration an app is created with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FirebaseOptions {
    pub api_key: Option<String>,
    pub auth_domain: Option<String>,
    pub project_id: Option<String>,
    pub storage_bucket: Option<String>,
    pub messaging_sender_id: Option<String>,
    pub app_id: Option<String>,
}

impl FirebaseOptions {
    /// Whether at least one field is set.
    pub fn is_defined(&self) -> bool {
        self.api_key.is_some()
            || self.auth_domain.is_some()
            || self.project_id.is_some()
            || self.storage_bucket.is_some()
            || self.messaging_sender_id.is_some()
            || self.app_id.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FirebaseAppSettings {
    /// Defaults to [`DEFAULT_ENTRY_NAME`](crate::component::DEFAULT_ENTRY_NAME).
    pub name: Option<String>,
    /// Defaults to `true`.
    pub automatic_data_collection_enabled: Option<bool>,
}

/// Resolved app settings; two apps with the same name must agree on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirebaseAppConfig {
    pub name: Arc<str>,
    pub automatic_data_collection_enabled: bool,
}

impl FirebaseAppConfig {
    pub fn new(name: impl Into<String>, automatic_data_collection_enabled: bool) -> Self {
        Self {
            name: Arc::from(name.into()),
            automatic_data_collection_enabled,
        }
    }
}

/// A named app owning the component container its services live in.
#[derive(Clone)]
pub struct FirebaseApp {
    inner: Arc<FirebaseAppInner>,
}

struct FirebaseAppInner {
    options: FirebaseOptions,
    config: FirebaseAppConfig,
    is_deleted: AtomicBool,
    container: ComponentContainer,
}

impl FirebaseApp {
    pub(crate) fn new(options: FirebaseOptions, config: FirebaseAppConfig, container: ComponentContainer) -> Self {
        let app = Self {
            inner: Arc::new(FirebaseAppInner {
                options,
                config,
                is_deleted: AtomicBool::new(false),
                container,
            }),
        };
        let root: DynService = Arc::new(app.clone());
        app.inner.container.attach_root_service(root);
        app
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn options(&self) -> &FirebaseOptions {
        &self.inner.options
    }

    pub fn config(&self) -> &FirebaseAppConfig {
        &self.inner.config
    }

    pub fn automatic_data_collection_enabled(&self) -> bool {
        self.inner.config.automatic_data_collection_enabled
    }

    pub fn container(&self) -> ComponentContainer {
        self.inner.container.clone()
    }

    pub fn add_component(&self, component: Component) -> AppResult<()> {
        self.check_destroyed()?;
        self.inner.container.add_component(component).map_err(AppError::from)
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.is_deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_deleted(&self) {
        self.inner.is_deleted.store(true, Ordering::SeqCst);
    }

    pub fn check_destroyed(&self) -> AppResult<()> {
        if self.is_deleted() {
            return Err(AppError::AppDeleted {
                app_name: self.name().to_owned(),
            });
        }
        Ok(())
    }

    /// Whether both handles refer to the same app instance.
    pub fn ptr_eq(&self, other: &FirebaseApp) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for FirebaseApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirebaseApp")
            .field("name", &self.name())
            .field("project_id", &self.inner.options.project_id)
            .field("is_deleted", &self.is_deleted())
            .finish()
    }
}
