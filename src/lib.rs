pub mod cli;

pub mod canvas;
pub mod config;
pub mod crdt;
pub mod doc;
pub mod error;
pub mod fabric;
pub mod fractional;
pub mod logging;
pub mod query;
pub mod session;
pub mod transaction;
pub mod upstream;
mod web;

pub use config::{Config, UpstreamConfig};
pub use error::{ApiError, ErrorCode, TransactionFailure, TxStep};
pub use fabric::Fabric;
pub use query::{DocumentSummary, HierarchyNode, Navigator};
pub use session::{Connector, Session, UpstreamConnector};
pub use transaction::{Composer, CreateDocumentSpec, CreatedDocument, UpdateDocumentPatch};
pub use web::{AppContext, LiveServer};
