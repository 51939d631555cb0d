//! API handlers.
//!
//! Every handler takes the shared state and an [`ApiRequest`] and returns an
//! [`ApiFuncResult`]; the dispatcher turns that into a response.

mod admin;
mod ingest;
mod notifications;
mod query;
mod rules;
mod series;
mod status;
mod targets;

pub use admin::*;
pub use ingest::*;
pub use notifications::*;
pub use query::*;
pub use rules::*;
pub use series::*;
pub use status::*;
pub use targets::*;

use super::response::Finalizer;
use crate::engine::Query;
use crate::storage::Querier;
use std::ops::Deref;
use std::sync::Arc;
use tracing::warn;

/// A storage resource that must be released exactly once.
pub trait Release: Send + Sync {
    fn release(&self);
}

impl Release for dyn Query {
    fn release(&self) {
        self.close();
    }
}

impl Release for dyn Querier {
    fn release(&self) {
        if let Err(e) = self.close() {
            warn!("error closing querier: {}", e);
        }
    }
}

/// Owns a resource and releases it when dropped, unless ownership of the
/// release was handed to a [`Finalizer`] first.
pub struct Guard<T: ?Sized + Release> {
    inner: Arc<T>,
    armed: bool,
}

impl<T: ?Sized + Release> Guard<T> {
    pub fn new(inner: Box<T>) -> Self {
        Self {
            inner: Arc::from(inner),
            armed: true,
        }
    }

    /// Give up local release; the returned finalizer does it instead.
    pub fn into_finalizer(mut self) -> Finalizer
    where
        T: 'static,
    {
        self.armed = false;
        let inner = self.inner.clone();
        Finalizer::new(move || inner.release())
    }
}

impl<T: ?Sized + Release> Deref for Guard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized + Release> Drop for Guard<T> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release();
        }
    }
}
