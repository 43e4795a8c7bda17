pub mod format;
pub mod logging;
pub mod path;
pub mod sos;
