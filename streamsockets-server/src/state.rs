//! Shared application state passed to the admission gate and connection
//! handlers.

use std::sync::Arc;

use crate::accounts::AccountStore;
use crate::config::Config;

pub struct AppState {
    pub config: Arc<Config>,
    pub accounts: Arc<AccountStore>,
}
