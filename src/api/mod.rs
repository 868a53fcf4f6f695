pub mod middleware;
pub mod routes;

pub use middleware::log_request_errors;
pub use routes::{
    access_asset, create_session, health, record_purchase, register_asset, serve_object,
};
