pub mod discovery;
pub mod handlers;
pub mod models;
pub mod rewrite;
pub mod routes;
