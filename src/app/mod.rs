//! App registry. Each app owns a [`ComponentContainer`](crate::component::ComponentContainer)
//! from which its services are resolved.

mod api;
mod errors;
mod registry;
mod types;

pub use api::{delete_app, get_app, get_apps, initialize_app, SDK_VERSION};
pub use errors::{AppError, AppResult};
pub use registry::{get_provider, register_component, remove_service_instance};
pub use types::{FirebaseApp, FirebaseAppConfig, FirebaseAppSettings, FirebaseOptions};
