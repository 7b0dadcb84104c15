pub mod audit;
pub mod events;
pub mod handlers;
pub mod heatmap;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_api_router;
