use std::time::Duration;

use server_api::ApiContext;

use crate::hub::Hub;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SocketLimits {
    pub(crate) auth_timeout: Duration,
    pub(crate) idle_timeout: Duration,
}

pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) hub: Hub,
    pub(crate) limits: SocketLimits,
}
