use std::fmt;

use crate::component::ComponentError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    NoApp { app_name: String },
    BadAppName { app_name: String },
    DuplicateApp { app_name: String },
    AppDeleted { app_name: String },
    NoOptions,
    ComponentFailure { component: String, message: String },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::NoApp { app_name } => {
                write!(f, "No app '{app_name}' has been created - call initialize_app() first")
            }
            AppError::BadAppName { app_name } => write!(f, "Illegal app name: '{app_name}'"),
            AppError::DuplicateApp { app_name } => {
                write!(f, "App named '{app_name}' already exists with different options or config")
            }
            AppError::AppDeleted { app_name } => write!(f, "App named '{app_name}' already deleted"),
            AppError::NoOptions => write!(f, "Need to provide options with at least one field set"),
            AppError::ComponentFailure { component, message } => {
                write!(f, "Component {component} error: {message}")
            }
        }
    }
}

impl std::error::Error for AppError {}

impl From<ComponentError> for AppError {
    fn from(err: ComponentError) -> Self {
        let (component, message) = match err {
            ComponentError::MismatchingComponent { expected, found } => {
                (found, format!("does not satisfy provider for {expected}"))
            }
            ComponentError::ComponentAlreadyProvided { name } => (name, "component already provided".to_string()),
            ComponentError::InstanceAlreadyInitialized { name, identifier } => {
                (name, format!("instance {identifier} already initialized"))
            }
            ComponentError::InitializationFailed { name, reason } => (name, reason),
            ComponentError::InstanceUnavailable { name } => (name, "instance unavailable".to_string()),
        };
        AppError::ComponentFailure { component, message }
    }
}

impl From<AppError> for ComponentError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::ComponentFailure { component, message } => ComponentError::InitializationFailed {
                name: component,
                reason: message,
            },
            other => ComponentError::InitializationFailed {
                name: "app".to_string(),
                reason: other.to_string(),
            },
        }
    }
}
