pub mod config;
pub mod environment;
pub mod feature_toggle;
pub mod import;
pub mod project;
pub mod segment;
