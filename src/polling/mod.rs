pub mod fingerprint;
pub mod scheduler;

pub use scheduler::Poller;
