pub mod backend;
pub mod frontend;
pub mod messages;
mod wire;

pub use messages::BackendMessage;
pub use messages::FrontendMessage;
pub use wire::HEADER_LEN;
