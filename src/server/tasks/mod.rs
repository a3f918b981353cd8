pub mod handlers;
pub mod models;
pub mod routes;

pub use routes::routes;
