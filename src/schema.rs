use anyhow::Result;
use tracing::info;

use crate::configuration::StoreTarget;
use crate::gateway::StorageGateway;

/// Creates the target table unless it is already listed.
/// Returns whether the table was created.
pub async fn ensure_table(gateway: &dyn StorageGateway, target: &StoreTarget) -> Result<bool> {
    let tables = gateway.list_tables().await?;
    if tables.contains(&target.table) {
        info!(table_name = %target.table, "table already exists");
        return Ok(false);
    }

    gateway.create_table(&target.table).await?;
    info!(table_name = %target.table, "table created successfully");
    Ok(true)
}

/// Creates the target column family unless the table already has it.
/// Returns whether the family was created.
pub async fn ensure_column_family(
    gateway: &dyn StorageGateway,
    target: &StoreTarget,
) -> Result<bool> {
    let info = gateway.table_info(&target.table).await?;
    if info.families.contains(&target.column_family) {
        info!(column_family_name = %target.column_family, "column family already exists");
        return Ok(false);
    }

    gateway
        .create_column_family(&target.table, &target.column_family)
        .await?;
    info!(column_family_name = %target.column_family, "column family created successfully");
    Ok(true)
}

/// Makes sure both the table and the column family exist, in that order.
pub async fn ensure_schema(gateway: &dyn StorageGateway, target: &StoreTarget) -> Result<()> {
    ensure_table(gateway, target).await?;
    ensure_column_family(gateway, target).await?;
    Ok(())
}
