//! API v1 routes.

mod providers;
mod workers;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(workers::routes())
        .merge(providers::routes())
}
