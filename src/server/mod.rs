pub mod routes;

use std::sync::Arc;

use axum::Router;
use tokio::sync::broadcast;

use crate::dispatch::{DispatchEvent, Dispatcher};
use crate::groups::GroupTracker;
use crate::reaper::TtlReaper;
use crate::snapshot::builder::SnapshotBuilder;
use crate::state::FlowStateStore;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub builder: Arc<SnapshotBuilder>,
    pub dispatcher: Arc<Dispatcher>,
    pub reaper: Arc<TtlReaper>,
    pub flow_state: Arc<FlowStateStore>,
    /// Replacement/cleanup group bookkeeping on behalf of stateless adapters.
    pub groups: Arc<GroupTracker>,
    pub events_tx: broadcast::Sender<DispatchEvent>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
