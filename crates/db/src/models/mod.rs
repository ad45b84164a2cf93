pub mod environment;
pub mod feature;
pub mod feature_environment;
pub mod feature_strategy;
pub mod import_toggles;
pub mod project;
pub mod segment;
pub mod variant;
