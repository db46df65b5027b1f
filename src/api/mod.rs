//! HTTP surface: health, mailbox check, classification and upload routes.

mod routes;

pub use routes::{AppState, MAX_UPLOAD_BYTES, api_routes};
