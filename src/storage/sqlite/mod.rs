//! SQLite implementations of the pipeline's own stores.

mod checkpoint_store;
mod payment_store;
mod source_registry;

pub use checkpoint_store::SqliteCheckpointStore;
pub use payment_store::{NewPayment, PaymentRecord, PaymentStore};
pub use source_registry::{PaymentSource, SourceRegistry};
