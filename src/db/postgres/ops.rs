use anyhow::Context;
use async_trait::async_trait;
use log::error;

use crate::db::models::{Watermark, WatermarkKey};
use crate::db::postgres::PostgresClient;
use crate::db::WatermarkStore;

fn to_db(value: u64, column: &str) -> anyhow::Result<i64> {
    i64::try_from(value).with_context(|| format!("{column} {value} does not fit BIGINT"))
}

fn from_db(value: i64, column: &str) -> anyhow::Result<u64> {
    u64::try_from(value).with_context(|| format!("{column} {value} is negative"))
}

#[async_trait]
impl WatermarkStore for PostgresClient {
    async fn load(&self, key: &WatermarkKey) -> anyhow::Result<Option<Watermark>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT chain_id, contract_address, last_confirmed_block, updated_at
            FROM domwatch.watermarks
            WHERE chain_id = $1 AND contract_address = $2
        "#;

        let chain_id = to_db(key.chain_id, "chain_id")?;
        let row = client
            .query_opt(query, &[&chain_id, &key.contract_address])
            .await?;

        row.map(|r| -> anyhow::Result<Watermark> {
            Ok(Watermark {
                chain_id: from_db(r.get("chain_id"), "chain_id")?,
                contract_address: r.get("contract_address"),
                last_confirmed_block: from_db(r.get("last_confirmed_block"), "last_confirmed_block")?,
                updated_at: r.get("updated_at"),
            })
        })
        .transpose()
    }

    async fn save(&self, watermark: &Watermark) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO domwatch.watermarks (chain_id, contract_address, last_confirmed_block, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (chain_id, contract_address) DO UPDATE SET
                last_confirmed_block = EXCLUDED.last_confirmed_block,
                updated_at = EXCLUDED.updated_at
        "#;

        let chain_id = to_db(watermark.chain_id, "chain_id")?;
        let block = to_db(watermark.last_confirmed_block, "last_confirmed_block")?;

        client
            .execute(
                query,
                &[&chain_id, &watermark.contract_address, &block, &watermark.updated_at],
            )
            .await
            .map_err(|e| {
                error!("[STORE] Failed to upsert watermark for {}: {:?}", watermark.key(), e);
                e
            })?;

        Ok(())
    }
}
