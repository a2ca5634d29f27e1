use std::{collections::HashMap, future::Future, sync::Arc};

use futures_util::future::BoxFuture;

use crate::error::Error;

use super::{
    field::{FieldData, FieldMap},
    request::{Operation, Request},
    response::Response,
};

pub type OperationFuture = BoxFuture<'static, Result<Option<Response>, Error>>;

/// Callback invoked for one operation on one path.
pub type OperationFunc = Arc<dyn Fn(Request, FieldData) -> OperationFuture + Send + Sync>;

/// Reports whether the object a request targets already exists, which decides
/// between create and update.
pub type ExistenceFunc =
    Arc<dyn Fn(Request, FieldData) -> BoxFuture<'static, Result<bool, Error>> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct OperationProperties {
    /// Must not run on a performance standby.
    pub forward_performance_standby: bool,
    /// Must not run on a performance secondary cluster.
    pub forward_performance_secondary: bool,
}

#[derive(Clone)]
pub struct PathOperation {
    pub callback: OperationFunc,
    pub properties: OperationProperties,
}

impl PathOperation {
    pub fn new(callback: OperationFunc) -> Self {
        Self {
            callback,
            properties: OperationProperties::default(),
        }
    }

    /// Marks the operation as one that writes state only the primary may hold.
    pub fn forward_to_primary(mut self) -> Self {
        self.properties.forward_performance_standby = true;
        self.properties.forward_performance_secondary = true;
        self
    }
}

impl From<OperationFunc> for PathOperation {
    fn from(callback: OperationFunc) -> Self {
        Self::new(callback)
    }
}

#[derive(Clone, Default)]
pub struct Path {
    /// Regex matched against the request path. Anchors are added when missing.
    pub pattern: String,
    pub fields: Arc<FieldMap>,
    pub operations: HashMap<Operation, PathOperation>,
    pub existence_check: Option<ExistenceFunc>,
    pub help_synopsis: String,
    pub help_description: String,
    /// Suppresses the unrecognized-parameter warning.
    pub takes_arbitrary_input: bool,
}

impl Path {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    pub fn fields(mut self, fields: Arc<FieldMap>) -> Self {
        self.fields = fields;
        self
    }

    pub fn operation(mut self, operation: Operation, op: impl Into<PathOperation>) -> Self {
        self.operations.insert(operation, op.into());
        self
    }

    pub fn existence_check(mut self, check: ExistenceFunc) -> Self {
        self.existence_check = Some(check);
        self
    }

    pub fn help(mut self, synopsis: impl Into<String>, description: impl Into<String>) -> Self {
        self.help_synopsis = synopsis.into();
        self.help_description = description.into();
        self
    }
}

/// Adapts an async method taking `Arc<T>` into an [`OperationFunc`].
pub fn handler<T, F, Fut>(target: &Arc<T>, f: F) -> OperationFunc
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, Request, FieldData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Response>, Error>> + Send + 'static,
{
    let target = target.clone();
    Arc::new(move |req: Request, data: FieldData| -> OperationFuture {
        Box::pin(f(target.clone(), req, data))
    })
}

/// Adapts an async method taking `Arc<T>` into an [`ExistenceFunc`].
pub fn existence<T, F, Fut>(target: &Arc<T>, f: F) -> ExistenceFunc
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, Request, FieldData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, Error>> + Send + 'static,
{
    let target = target.clone();
    Arc::new(
        move |req: Request, data: FieldData| -> BoxFuture<'static, Result<bool, Error>> {
            Box::pin(f(target.clone(), req, data))
        },
    )
}

/// Anchors `pattern` at both ends.
pub(crate) fn anchored(pattern: &str) -> String {
    let mut anchored = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('^') {
        anchored.push('^');
    }
    anchored.push_str(pattern);
    if !pattern.ends_with('$') {
        anchored.push('$');
    }
    anchored
}
