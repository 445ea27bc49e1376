//! HandlerRegistry - Handler の登録と管理
//!
//! # 設計
//! - 起動時に組み立てる（mutable）
//! - 実行時は共有して読むだけ（immutable、ロック不要）
//! - interceptor は登録完了後に一度だけ巻く（hot path では何もしない）

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;
use crate::app::interceptor::Interceptor;
use crate::domain::{CourierError, TaskType};

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a raw handler. Registering the same type twice is an error.
    pub fn register(
        &mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), CourierError> {
        let task_type = task_type.into();
        if !task_type.is_valid() {
            return Err(CourierError::InvalidOptions(
                "task type must not be empty".to_string(),
            ));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(CourierError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Register a typed handler under `T::TYPE`.
    pub fn register_typed<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), CourierError> {
        self.register(T::TYPE, Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    pub fn lookup(&self, task_type: &TaskType) -> Result<Arc<dyn DynHandler>, CourierError> {
        self.handlers
            .get(task_type)
            .cloned()
            .ok_or_else(|| CourierError::UnknownTaskType(task_type.clone()))
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered types, sorted.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Wrap every handler with `interceptors`; the first one ends up outermost.
    pub fn with_interceptors(mut self, interceptors: &[Arc<dyn Interceptor>]) -> Self {
        for handler in self.handlers.values_mut() {
            let mut wrapped = Arc::clone(handler);
            for interceptor in interceptors.iter().rev() {
                wrapped = interceptor.intercept(wrapped);
            }
            *handler = wrapped;
        }
        self
    }
}
