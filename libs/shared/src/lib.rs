pub mod fingerprint;
pub mod message;
pub mod rpc;

pub use fingerprint::resolve_key;
pub use message::{ContentPart, Message, Role};
