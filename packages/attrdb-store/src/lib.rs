pub mod config;
pub mod error;
pub mod keys;
pub mod kv;
pub mod mock;
pub mod natural;
pub mod schema;
pub mod store;
pub mod validate;

pub use config::StoreConfig;
pub use error::{Result, StoreError, ValidationError, ValidationErrors};
pub use kv::{Kv, KvEvent, KvEventKind, KvWatch};
pub use mock::MockStore;
pub use schema::{AttributeSchema, Cardinality, SchemaType, Unique};
pub use store::{
    EntityEvent, EntityOp, EntityStore, EntityWatch, SessionId, Store, WriteOptions,
};
