use std::ops::Deref;
use std::sync::Arc;

use axum::extract::FromRef;

use crate::follow_reactor::FollowGraphReactor;
use crate::metrics::Metrics;
use crate::timeline_cache::TimelineCache;
use crate::timeline_store::TimelineStore;

pub struct InnerAdminContext {
    pub(crate) store: TimelineStore,
    pub(crate) cache: TimelineCache,
    pub(crate) reactor: FollowGraphReactor,
    pub(crate) metrics: Metrics,
    pub(crate) version: String,
}

#[derive(Clone, FromRef)]
pub struct AdminContext(pub(crate) Arc<InnerAdminContext>);

impl Deref for AdminContext {
    type Target = InnerAdminContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AdminContext {
    pub fn new(
        store: TimelineStore,
        cache: TimelineCache,
        reactor: FollowGraphReactor,
        metrics: Metrics,
        version: &str,
    ) -> Self {
        Self(Arc::new(InnerAdminContext {
            store,
            cache,
            reactor,
            metrics,
            version: version.to_string(),
        }))
    }
}
