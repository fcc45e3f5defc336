pub mod hub;
pub mod messages;
pub mod session;

pub use hub::Hub;
pub use messages::ServerMessage;
