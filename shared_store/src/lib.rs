pub mod driver;
pub mod keys;
pub mod serializer;

pub use driver::{open_store, ConnectionOptions, Error, SharedStore};
pub use keys::Key;
