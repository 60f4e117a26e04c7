pub mod error;
pub mod health;
pub mod sync;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

/// Routes nested under `/api`.
pub fn get_api_routes() -> Router<AppState> {
    Router::new()
        .route("/update-sheets", post(sync::update_sheets))
        .route("/runs", get(sync::list_runs))
        .route("/runs/{spreadsheet_id}", get(sync::get_run))
}
