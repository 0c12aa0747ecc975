//! Where the index reads from: a listing for the initial scan and a watch for
//! everything after it.

use async_trait::async_trait;
use unistore_core::{ListRequest, ListResponse, ResourceResult, WatchRequest};
use unistore_store::{Backend, Subscription};

#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn list(&self, req: &ListRequest) -> ResourceResult<ListResponse>;
    async fn watch(&self, req: &WatchRequest) -> ResourceResult<Subscription>;
}

#[async_trait]
impl ResourceSource for Backend {
    async fn list(&self, req: &ListRequest) -> ResourceResult<ListResponse> { Backend::list(self, req).await }

    async fn watch(&self, req: &WatchRequest) -> ResourceResult<Subscription> { Backend::watch(self, req).await }
}
