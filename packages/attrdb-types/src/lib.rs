pub mod attr;
pub mod codec;
pub mod entity;
pub mod error;
pub mod id;
pub mod value;

pub use attr::Attr;
pub use entity::Entity;
pub use error::{DataError, Result};
pub use id::{Id, Keyword};
pub use value::{Value, ValueKind};
