use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::component::container::ComponentContainer;

/// Type-erased service instance held by a provider.
pub type DynService = Arc<dyn Any + Send + Sync>;

/// When a provider creates the instance of its component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstantiationMode {
    /// On first lookup.
    Lazy,
    /// As soon as the component is attached to a container.
    Eager,
    /// Only through [`Provider::initialize`](crate::component::Provider::initialize).
    Explicit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentType {
    Public,
    Private,
}

/// Arguments handed to an instance factory.
#[derive(Debug, Clone, Default)]
pub struct InstanceFactoryOptions {
    /// `None` for the default instance.
    pub instance_identifier: Option<String>,
    pub options: Value,
}

impl InstanceFactoryOptions {
    pub fn new(instance_identifier: Option<String>, options: Value) -> Self {
        Self {
            instance_identifier,
            options,
        }
    }
}

pub type InstanceFactory =
    Arc<dyn Fn(&ComponentContainer, InstanceFactoryOptions) -> Result<DynService, ComponentError> + Send + Sync>;

pub type OnInstanceCreatedCallback = Arc<dyn Fn(&ComponentContainer, &str, &DynService) + Send + Sync>;

/// Called with each instance a provider drops when it is deleted.
pub type OnInstanceDeletedCallback = Arc<dyn Fn(&DynService) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    MismatchingComponent { expected: String, found: String },
    ComponentAlreadyProvided { name: String },
    InstanceAlreadyInitialized { name: String, identifier: String },
    InitializationFailed { name: String, reason: String },
    InstanceUnavailable { name: String },
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentError::MismatchingComponent { expected, found } => {
                write!(f, "Component {found} cannot satisfy provider for {expected}")
            }
            ComponentError::ComponentAlreadyProvided { name } => {
                write!(f, "Component {name} has already been registered")
            }
            ComponentError::InstanceAlreadyInitialized { name, identifier } => {
                write!(f, "{name}({identifier}) has already been initialized")
            }
            ComponentError::InitializationFailed { name, reason } => {
                write!(f, "Component {name} failed to initialize: {reason}")
            }
            ComponentError::InstanceUnavailable { name } => write!(f, "Service {name} is not available"),
        }
    }
}

impl std::error::Error for ComponentError {}
