pub mod dispatcher;
pub mod format;
pub mod push;
pub mod quiet_hours;

pub use dispatcher::Dispatcher;
