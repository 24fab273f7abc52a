pub mod connection;
pub mod hub;
pub mod source;

pub use hub::Hub;
pub use source::{ChangeSource, ChangeStream};
