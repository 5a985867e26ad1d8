//! A relational client for dynamic-rest style HTTP apis.
//!
//! Abstract read and write queries compile into flat request parameters
//! (`filter{...}`, `include[]`/`exclude[]`, `sort[]`, `page`/`per_page`) and
//! the flat JSON responses are reassembled back into relational rows,
//! following relation keys through the embedded collections and fanning out
//! over to-many relations.
//!
//! The entry point is [`executor::RestDatabase`], built from an
//! [`transport::ApiConnection`] and a [`schema::RestSchema`] catalog.

pub mod compiler;
pub mod error;
pub mod executor;
pub mod query;
pub mod response;
pub mod schema;
pub mod transport;
pub mod value;

pub use error::RestError;
pub use executor::RestDatabase;
pub use transport::{ApiConnection, Auth};
