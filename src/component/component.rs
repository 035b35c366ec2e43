use std::sync::Arc;

use crate::component::container::ComponentContainer;
use crate::component::types::{
    ComponentType, DynService, InstanceFactory, InstantiationMode, OnInstanceCreatedCallback,
    OnInstanceDeletedCallback,
};

/// A named service factory that containers instantiate on demand.
#[derive(Clone)]
pub struct Component {
    name: Arc<str>,
    pub(crate) instance_factory: InstanceFactory,
    pub(crate) ty: ComponentType,
    pub(crate) instantiation_mode: InstantiationMode,
    pub(crate) multiple_instances: bool,
    pub(crate) on_instance_created: Option<OnInstanceCreatedCallback>,
    pub(crate) on_instance_deleted: Option<OnInstanceDeletedCallback>,
}

impl Component {
    pub fn new(name: impl Into<String>, instance_factory: InstanceFactory, ty: ComponentType) -> Self {
        Self {
            name: Arc::from(name.into()),
            instance_factory,
            ty,
            instantiation_mode: InstantiationMode::Lazy,
            multiple_instances: false,
            on_instance_created: None,
            on_instance_deleted: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component_type(&self) -> ComponentType {
        self.ty
    }

    pub fn instantiation_mode(&self) -> InstantiationMode {
        self.instantiation_mode
    }

    /// Whether instances are keyed by identifier rather than shared.
    pub fn multiple_instances(&self) -> bool {
        self.multiple_instances
    }

    pub fn with_instantiation_mode(mut self, mode: InstantiationMode) -> Self {
        self.instantiation_mode = mode;
        self
    }

    pub fn with_multiple_instances(mut self, multiple: bool) -> Self {
        self.multiple_instances = multiple;
        self
    }

    pub fn with_instance_created_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ComponentContainer, &str, &DynService) + Send + Sync + 'static,
    {
        self.on_instance_created = Some(Arc::new(callback));
        self
    }

    /// Runs `callback` for every instance dropped by `Provider::delete`, e.g.
    /// to shut the service down when its app is deleted.
    pub fn with_instance_deleted_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DynService) + Send + Sync + 'static,
    {
        self.on_instance_deleted = Some(Arc::new(callback));
        self
    }
}
