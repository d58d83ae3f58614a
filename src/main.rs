use passclass_api::ConfigBuilder;
use passclass_api::app::{AppContext, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    passclass_api::init_tracing();

    let config = ConfigBuilder::from_env().build()?;

    #[cfg(feature = "database")]
    let context = {
        use passclass_api::billing::SeaOrmBillingStore;
        use std::sync::Arc;

        let db = sea_orm::Database::connect(&config.database.url).await?;
        let store = SeaOrmBillingStore::new(db);
        AppContext::with_stores(config, Arc::new(store.clone()), Arc::new(store))?
    };

    #[cfg(not(feature = "database"))]
    let context = AppContext::in_memory(config)?;

    serve(context).await?;
    Ok(())
}
