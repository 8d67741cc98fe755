//! # Background Controllers
//!
//! Rate-limited, de-duplicating work-queue controllers that keep the
//! APIService store in line with what the server serves:
//!
//! - [`workqueue`]: the queue and its retry policies
//! - [`reconciler`]: the generic worker loop
//! - [`autoregister`]: desired APIServices -> APIService store
//! - [`crdregistration`]: served CRD versions -> desired APIServices
//! - [`priority`]: the group version priority table

pub mod apiregistration;
pub mod autoregister;
pub mod crdregistration;
pub mod priority;
pub mod reconciler;
pub mod workqueue;

pub use apiregistration::{
    ApiService, ApiServiceClient, ApiServiceLister, GroupVersion, InMemoryApiServiceStore,
};
pub use autoregister::{AutoApiServiceRegistration, AutoRegisterController};
pub use crdregistration::{CrdLister, CrdRegistrationController, InMemoryCrdStore};
pub use priority::{api_services_to_register, sort_by_priority, ApiVersionPriorities};
pub use reconciler::{Controller, ErrorSink, LogErrorSink, Reconciler};
pub use workqueue::{RateLimitingQueue, WorkQueue, WorkQueueError};
