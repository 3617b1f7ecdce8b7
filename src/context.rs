//! Shared bridge state threaded through the gateway, sessions and admin
//! commands as one `Arc`.

use std::sync::Arc;

use crate::config::{Config, Store};
use crate::identd::IdentTable;
use crate::matrix::MatrixApi;
use crate::session::registry::SessionRegistry;

pub struct BridgeContext {
    pub config: Config,
    pub store: Store,
    pub matrix: Arc<dyn MatrixApi>,
    pub registry: SessionRegistry,
    pub identd: IdentTable,
}

impl BridgeContext {
    pub fn new(config: Config, store: Store, matrix: Arc<dyn MatrixApi>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            matrix,
            registry: SessionRegistry::new(),
            identd: crate::identd::new_table(),
        })
    }
}
