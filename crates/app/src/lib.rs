pub mod chat;
pub mod console;
pub mod dashboard;
pub mod images;
pub mod records;
pub mod session;
pub mod settings;
pub mod sync;
pub mod telemetry;
