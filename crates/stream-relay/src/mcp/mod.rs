pub mod router;
pub mod sse;
pub mod transport;

pub use router::DefaultHandler;
pub use transport::{handle_delete, handle_get, handle_post, HEADER_SESSION_ID};
