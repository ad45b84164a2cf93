pub mod instrumentation;
pub mod logging;
pub mod response;
