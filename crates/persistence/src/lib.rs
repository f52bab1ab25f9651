//! Postgres persistence layer
//!
//! One store per entity, all sharing a single connection pool. Every write
//! is an UPSERT keyed on `call_id` (or `phone` for leads), so repeated
//! finalization of the same call is a no-op at the database layer.

mod calls;
mod client;
mod conversations;
mod costs;
mod error;
mod leads;
mod schema;
mod transfers;

pub use calls::{CarrierCallRow, CarrierCallStore};
pub use client::PgClient;
pub use conversations::{ConversationFilter, ConversationStore, DurationFilter};
pub use costs::{CostAggregates, CostRow, CostStore};
pub use error::PersistenceError;
pub use leads::LeadStore;
pub use transfers::TransferStore;

use outdial_config::PersistenceConfig;

/// All stores, ready to share across the application
#[derive(Clone)]
pub struct PersistenceLayer {
    pub client: PgClient,
    pub leads: LeadStore,
    pub calls: CarrierCallStore,
    pub conversations: ConversationStore,
    pub costs: CostStore,
    pub transfers: TransferStore,
}

/// Connect to Postgres and ensure the schema exists.
pub async fn init(config: &PersistenceConfig) -> Result<PersistenceLayer, PersistenceError> {
    let client = PgClient::connect(config).await?;
    client.ensure_schema().await?;

    let pool = client.pool().clone();
    Ok(PersistenceLayer {
        leads: LeadStore::new(pool.clone()),
        calls: CarrierCallStore::new(pool.clone()),
        conversations: ConversationStore::new(pool.clone()),
        costs: CostStore::new(pool.clone()),
        transfers: TransferStore::new(pool),
        client,
    })
}
