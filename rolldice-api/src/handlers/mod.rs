mod app;
mod rolldice;

pub use app::{add_routes, AppState};
