pub mod logger;
pub mod models;
pub mod progress_view;
