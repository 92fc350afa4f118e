mod records;

pub use records::*;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use hydrascan_common::{
    config::{
        DB_POOL_ACQUIRE_TIMEOUT_SECS, DB_POOL_IDLE_TIMEOUT_SECS, DB_POOL_MAX_CONNECTIONS,
    },
    network::Network,
};

use crate::config::DatabaseConfig;
use crate::logs::DensityStats;
use crate::optimizer::{Operation, OptimizerState};

// DDL executed statement by statement at startup; everything is
// idempotent so repeated starts are harmless
const SCHEMA: [&str; 12] = [
    "CREATE TABLE IF NOT EXISTS addresses (
        address TEXT NOT NULL,
        network TEXT NOT NULL,
        first_seen BIGINT NOT NULL,
        last_updated BIGINT NOT NULL,
        code_hash TEXT,
        contract_name TEXT,
        deployed BIGINT,
        tags TEXT[],
        fund BIGINT,
        last_fund_updated BIGINT,
        name_checked BOOLEAN,
        name_checked_at BIGINT,
        UNIQUE (address, network)
    )",
    "CREATE INDEX IF NOT EXISTS idx_addresses_network_fund
        ON addresses (network, fund DESC)",
    "CREATE INDEX IF NOT EXISTS idx_addresses_network_first_seen
        ON addresses (network, first_seen DESC)",
    "CREATE INDEX IF NOT EXISTS idx_addresses_tags
        ON addresses USING GIN (tags)",
    "CREATE INDEX IF NOT EXISTS idx_addresses_address_prefix
        ON addresses (address text_pattern_ops)",
    "CREATE TABLE IF NOT EXISTS symbol_prices (
        symbol TEXT PRIMARY KEY,
        price_usd DOUBLE PRECISION NOT NULL,
        last_updated BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS network_log_density_stats (
        network TEXT PRIMARY KEY,
        avg_logs_per_block DOUBLE PRECISION NOT NULL,
        total_blocks BIGINT NOT NULL,
        total_logs BIGINT NOT NULL,
        sample_count BIGINT NOT NULL,
        optimal_batch_size BIGINT NOT NULL,
        recommended_profile TEXT NOT NULL,
        last_updated BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chunk_optimizer_sessions (
        network TEXT NOT NULL,
        operation TEXT NOT NULL,
        data JSONB NOT NULL,
        updated_at BIGINT NOT NULL,
        PRIMARY KEY (network, operation)
    )",
    "CREATE TABLE IF NOT EXISTS scan_cursors (
        network TEXT PRIMARY KEY,
        last_block BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS helper_contracts (
        network TEXT NOT NULL,
        contract TEXT NOT NULL,
        address TEXT NOT NULL,
        updated_at BIGINT NOT NULL,
        PRIMARY KEY (network, contract)
    )",
    "CREATE TABLE IF NOT EXISTS network_address_counts (
        network TEXT PRIMARY KEY,
        total BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )",
    // refreshed out of band; backs the hide-unnamed listing fast path
    "CREATE MATERIALIZED VIEW IF NOT EXISTS mv_distinct_contracts AS
        SELECT DISTINCT ON (contract_name)
            contract_name, address, network, fund
        FROM addresses
        WHERE contract_name IS NOT NULL
        ORDER BY contract_name, fund DESC NULLS LAST",
];

const UPSERT_ADDRESS: &str = "INSERT INTO addresses (
        address, network, first_seen, last_updated, code_hash, contract_name,
        deployed, tags, fund, last_fund_updated, name_checked, name_checked_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (address, network) DO UPDATE SET
        first_seen = LEAST(addresses.first_seen, EXCLUDED.first_seen),
        last_updated = EXCLUDED.last_updated,
        code_hash = COALESCE(EXCLUDED.code_hash, addresses.code_hash),
        contract_name = COALESCE(EXCLUDED.contract_name, addresses.contract_name),
        deployed = COALESCE(EXCLUDED.deployed, addresses.deployed),
        tags = CASE
            WHEN EXCLUDED.tags IS NOT NULL AND array_length(EXCLUDED.tags, 1) > 0
            THEN EXCLUDED.tags
            ELSE addresses.tags
        END,
        fund = COALESCE(EXCLUDED.fund, addresses.fund),
        last_fund_updated = COALESCE(EXCLUDED.last_fund_updated, addresses.last_fund_updated),
        name_checked = COALESCE(EXCLUDED.name_checked, addresses.name_checked),
        name_checked_at = COALESCE(EXCLUDED.name_checked_at, addresses.name_checked_at)";

const ADDRESS_COLUMNS: &str = "address, network, first_seen, last_updated, code_hash, \
     contract_name, deployed, tags, fund, last_fund_updated, name_checked, name_checked_at";

pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(config: &DatabaseConfig) -> sqlx::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(DB_POOL_MAX_CONNECTIONS)
            .idle_timeout(Duration::from_secs(DB_POOL_IDLE_TIMEOUT_SECS))
            .acquire_timeout(Duration::from_secs(DB_POOL_ACQUIRE_TIMEOUT_SECS))
            .connect(&config.dsn())
            .await?;
        Ok(Self { pool })
    }

    // Admin check with a one-shot pool against the maintenance
    // database; released as soon as the check is done
    pub async fn ensure_database(config: &DatabaseConfig) -> sqlx::Result<()> {
        let admin = DatabaseConfig {
            db_name: "postgres".to_string(),
            ..config.clone()
        };
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(DB_POOL_ACQUIRE_TIMEOUT_SECS))
            .connect(&admin.dsn())
            .await?;

        let exists = sqlx::query("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(&config.db_name)
            .fetch_optional(&pool)
            .await?
            .is_some();
        if !exists {
            info!("creating database {}", config.db_name);
            // identifiers cannot be bound as parameters
            sqlx::query(&format!("CREATE DATABASE \"{}\"", config.db_name))
                .execute(&pool)
                .await?;
        }
        pool.close().await;
        Ok(())
    }

    pub async fn init_schema(&self) -> sqlx::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ----- addresses -----

    // Per-row upsert with field preservation; duplicates inside the
    // batch are merged first so later rows cannot clobber earlier ones
    pub async fn upsert_addresses(&self, payloads: Vec<AddressUpsert>) -> sqlx::Result<usize> {
        let mut merged: indexmap::IndexMap<(String, String), AddressUpsert> =
            indexmap::IndexMap::with_capacity(payloads.len());
        for payload in payloads {
            let key = (payload.address.clone(), payload.network.clone());
            match merged.entry(key) {
                indexmap::map::Entry::Occupied(mut entry) => entry.get_mut().merge_from(payload),
                indexmap::map::Entry::Vacant(entry) => {
                    entry.insert(payload);
                }
            }
        }

        let count = merged.len();
        for payload in merged.into_values() {
            sqlx::query(UPSERT_ADDRESS)
                .bind(&payload.address)
                .bind(&payload.network)
                .bind(payload.first_seen)
                .bind(payload.last_updated)
                .bind(&payload.code_hash)
                .bind(&payload.contract_name)
                .bind(payload.deployed)
                .bind(&payload.tags)
                .bind(payload.fund)
                .bind(payload.last_fund_updated)
                .bind(payload.name_checked)
                .bind(payload.name_checked_at)
                .execute(&self.pool)
                .await?;
        }
        Ok(count)
    }

    pub async fn unclassified_addresses(
        &self,
        network: Network,
        limit: i64,
    ) -> sqlx::Result<Vec<AddressRecord>> {
        let sql = format!(
            "SELECT {ADDRESS_COLUMNS} FROM addresses
             WHERE network = $1
               AND (tags IS NULL OR NOT (tags && ARRAY['EOA','Contract']))
             ORDER BY first_seen DESC
             LIMIT $2"
        );
        sqlx::query_as(&sql)
            .bind(network.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn contracts_missing_name(
        &self,
        network: Network,
        limit: i64,
    ) -> sqlx::Result<Vec<AddressRecord>> {
        let sql = format!(
            "SELECT {ADDRESS_COLUMNS} FROM addresses
             WHERE network = $1 AND tags @> ARRAY['Contract']
               AND name_checked IS NOT TRUE
             ORDER BY fund DESC NULLS LAST
             LIMIT $2"
        );
        sqlx::query_as(&sql)
            .bind(network.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn stale_fund_holders(
        &self,
        network: Network,
        cutoff: i64,
        limit: i64,
    ) -> sqlx::Result<Vec<AddressRecord>> {
        let sql = format!(
            "SELECT {ADDRESS_COLUMNS} FROM addresses
             WHERE network = $1
               AND (last_fund_updated IS NULL OR last_fund_updated < $2)
             ORDER BY fund DESC NULLS LAST, last_fund_updated ASC NULLS FIRST
             LIMIT $3"
        );
        sqlx::query_as(&sql)
            .bind(network.to_string())
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    // Standard revalidation: unclassified records, or contracts
    // whose deployment data is still missing
    pub async fn revalidation_standard(
        &self,
        network: Network,
        limit: i64,
    ) -> sqlx::Result<Vec<AddressRecord>> {
        let sql = format!(
            "SELECT {ADDRESS_COLUMNS} FROM addresses
             WHERE network = $1 AND (
                 tags IS NULL
                 OR NOT (tags && ARRAY['EOA','Contract'])
                 OR (tags @> ARRAY['Contract'] AND deployed IS NULL)
             )
             ORDER BY fund DESC NULLS LAST, last_updated ASC NULLS FIRST
             LIMIT $2"
        );
        sqlx::query_as(&sql)
            .bind(network.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    // Recent revalidation: everything discovered inside the window,
    // already-validated records included; pages by offset so one pass
    // can walk the whole window without re-selecting repaired rows
    pub async fn revalidation_recent(
        &self,
        network: Network,
        since: i64,
        offset: i64,
        limit: i64,
    ) -> sqlx::Result<Vec<AddressRecord>> {
        let sql = format!(
            "SELECT {ADDRESS_COLUMNS} FROM addresses
             WHERE network = $1 AND first_seen >= $2
             ORDER BY first_seen DESC, fund DESC NULLS LAST
             LIMIT $3 OFFSET $4"
        );
        sqlx::query_as(&sql)
            .bind(network.to_string())
            .bind(since)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
    }

    // ----- paginated listing (interface of the HTTP layer) -----

    pub async fn list_addresses(
        &self,
        query: &AddressQuery,
    ) -> sqlx::Result<(Vec<AddressRecord>, Option<Cursor>)> {
        let sql = build_listing_sql(query);
        let mut q = sqlx::query_as::<_, AddressRecord>(&sql).bind(&query.networks);
        if let Some(cursor) = &query.cursor {
            match query.sort {
                SortKey::Fund => {
                    q = q
                        .bind(cursor.fund.unwrap_or(-1))
                        .bind(cursor.deployed.unwrap_or(-1))
                        .bind(&cursor.address);
                }
                SortKey::FirstSeen => {
                    q = q
                        .bind(cursor.first_seen.unwrap_or(-1))
                        .bind(&cursor.address);
                }
            }
        }
        let rows = q.bind(query.limit).fetch_all(&self.pool).await?;

        let next = if rows.len() as i64 == query.limit {
            rows.last().map(|row| Cursor::after_row(query.sort, row))
        } else {
            None
        };
        Ok((rows, next))
    }

    // Cached totals: summed per network when only network filters are
    // active, so the listing does not pay a count(*) per page
    pub async fn cached_total(&self, networks: &[String]) -> sqlx::Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total), 0)::BIGINT AS total
             FROM network_address_counts WHERE network = ANY($1)",
        )
        .bind(networks)
        .fetch_one(&self.pool)
        .await?;
        row.try_get("total")
    }

    pub async fn refresh_network_counts(&self, now: i64) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO network_address_counts (network, total, updated_at)
             SELECT network, COUNT(*), $1 FROM addresses GROUP BY network
             ON CONFLICT (network) DO UPDATE SET
                 total = EXCLUDED.total,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ----- symbol prices -----

    // Case-insensitive price map keyed by uppercased symbol
    pub async fn load_price_map(&self) -> sqlx::Result<HashMap<String, f64>> {
        let rows = sqlx::query("SELECT symbol, price_usd FROM symbol_prices")
            .fetch_all(&self.pool)
            .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let symbol: String = row.try_get("symbol")?;
            let price: f64 = row.try_get("price_usd")?;
            map.insert(symbol.to_uppercase(), price);
        }
        Ok(map)
    }

    // Bulk refresh in one transaction; any bad row rolls back the lot
    pub async fn upsert_prices(&self, prices: &[(String, f64)], now: i64) -> sqlx::Result<()> {
        let mut tx = self.pool.begin().await?;
        for (symbol, price) in prices {
            sqlx::query(
                "INSERT INTO symbol_prices (symbol, price_usd, last_updated)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (symbol) DO UPDATE SET
                     price_usd = EXCLUDED.price_usd,
                     last_updated = EXCLUDED.last_updated",
            )
            .bind(symbol)
            .bind(price)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ----- learned state -----

    pub async fn load_density_stats(&self, network: Network) -> sqlx::Result<Option<DensityStats>> {
        let row = sqlx::query(
            "SELECT avg_logs_per_block, total_blocks, total_logs, sample_count,
                    optimal_batch_size, recommended_profile, last_updated
             FROM network_log_density_stats WHERE network = $1",
        )
        .bind(network.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| DensityStats {
            avg_logs_per_block: row.get("avg_logs_per_block"),
            total_blocks: row.get::<i64, _>("total_blocks") as u64,
            total_logs: row.get::<i64, _>("total_logs") as u64,
            sample_count: row.get::<i64, _>("sample_count") as u64,
            optimal_batch_size: row.get::<i64, _>("optimal_batch_size") as u64,
            recommended_profile: row.get("recommended_profile"),
            last_updated: row.get::<i64, _>("last_updated") as u64,
        }))
    }

    // Single row per network, rewritten on every save
    pub async fn save_density_stats(
        &self,
        network: Network,
        stats: &DensityStats,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO network_log_density_stats (
                 network, avg_logs_per_block, total_blocks, total_logs,
                 sample_count, optimal_batch_size, recommended_profile, last_updated)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (network) DO UPDATE SET
                 avg_logs_per_block = EXCLUDED.avg_logs_per_block,
                 total_blocks = EXCLUDED.total_blocks,
                 total_logs = EXCLUDED.total_logs,
                 sample_count = EXCLUDED.sample_count,
                 optimal_batch_size = EXCLUDED.optimal_batch_size,
                 recommended_profile = EXCLUDED.recommended_profile,
                 last_updated = EXCLUDED.last_updated",
        )
        .bind(network.to_string())
        .bind(stats.avg_logs_per_block)
        .bind(stats.total_blocks as i64)
        .bind(stats.total_logs as i64)
        .bind(stats.sample_count as i64)
        .bind(stats.optimal_batch_size as i64)
        .bind(&stats.recommended_profile)
        .bind(stats.last_updated as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_optimizer_session(
        &self,
        network: Network,
        operation: Operation,
    ) -> sqlx::Result<Option<OptimizerState>> {
        let row = sqlx::query(
            "SELECT data FROM chunk_optimizer_sessions WHERE network = $1 AND operation = $2",
        )
        .bind(network.to_string())
        .bind(operation.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| {
            let data: Value = row.get("data");
            serde_json::from_value(data)
                .map_err(|e| warn!("{}/{}: discarding stored session: {}", network, operation, e))
                .ok()
        }))
    }

    pub async fn save_optimizer_session(
        &self,
        network: Network,
        operation: Operation,
        state: &OptimizerState,
        now: i64,
    ) -> sqlx::Result<()> {
        let data = serde_json::to_value(state).unwrap_or(Value::Null);
        sqlx::query(
            "INSERT INTO chunk_optimizer_sessions (network, operation, data, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (network, operation) DO UPDATE SET
                 data = EXCLUDED.data,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(network.to_string())
        .bind(operation.to_string())
        .bind(data)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ----- scan cursors & discovered helpers -----

    pub async fn load_cursor(&self, network: Network) -> sqlx::Result<Option<u64>> {
        let row = sqlx::query("SELECT last_block FROM scan_cursors WHERE network = $1")
            .bind(network.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("last_block") as u64))
    }

    pub async fn save_cursor(&self, network: Network, block: u64, now: i64) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO scan_cursors (network, last_block, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (network) DO UPDATE SET
                 last_block = EXCLUDED.last_block,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(network.to_string())
        .bind(block as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn helper_overrides(
        &self,
        network: Network,
    ) -> sqlx::Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT contract, address FROM helper_contracts WHERE network = $1")
            .bind(network.to_string())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("contract"), row.get("address")))
            .collect())
    }
}

// WHERE/ORDER composition for the keyset listing; bindings are
// positional and must match list_addresses
fn build_listing_sql(query: &AddressQuery) -> String {
    let mut sql = format!("SELECT {ADDRESS_COLUMNS} FROM addresses WHERE network = ANY($1)");
    if query.named_only {
        sql.push_str(" AND contract_name IS NOT NULL");
    }

    let mut next_param = 2;
    if query.cursor.is_some() {
        match query.sort {
            SortKey::Fund => {
                sql.push_str(
                    " AND (COALESCE(fund, -1) < $2
                       OR (COALESCE(fund, -1) = $2 AND COALESCE(deployed, -1) < $3)
                       OR (COALESCE(fund, -1) = $2 AND COALESCE(deployed, -1) = $3 AND address > $4))",
                );
                next_param = 5;
            }
            SortKey::FirstSeen => {
                sql.push_str(
                    " AND (first_seen < $2 OR (first_seen = $2 AND address > $3))",
                );
                next_param = 4;
            }
        }
    }

    match query.sort {
        SortKey::Fund => sql.push_str(
            " ORDER BY fund DESC NULLS LAST, deployed DESC NULLS LAST, address ASC",
        ),
        SortKey::FirstSeen => sql.push_str(" ORDER BY first_seen DESC, address ASC"),
    }
    sql.push_str(&format!(" LIMIT ${}", next_param));
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_query(sort: SortKey) -> AddressQuery {
        AddressQuery {
            networks: vec!["ethereum".to_string()],
            sort,
            limit: 50,
            cursor: None,
            named_only: false,
            include_total: false,
        }
    }

    #[test]
    fn test_listing_sql_without_cursor() {
        let sql = build_listing_sql(&base_query(SortKey::Fund));
        assert!(sql.contains("ORDER BY fund DESC NULLS LAST, deployed DESC NULLS LAST, address ASC"));
        assert!(sql.ends_with("LIMIT $2"));
        assert!(!sql.contains("COALESCE(fund, -1) <"));
    }

    #[test]
    fn test_listing_sql_with_fund_cursor() {
        let mut query = base_query(SortKey::Fund);
        query.cursor = Some(Cursor {
            sort: SortKey::Fund,
            fund: Some(10),
            deployed: Some(20),
            first_seen: None,
            address: "0xaa".to_string(),
        });
        let sql = build_listing_sql(&query);
        assert!(sql.contains("COALESCE(fund, -1) < $2"));
        assert!(sql.ends_with("LIMIT $5"));
    }

    #[test]
    fn test_listing_sql_first_seen_tiebreak() {
        let mut query = base_query(SortKey::FirstSeen);
        query.cursor = Some(Cursor {
            sort: SortKey::FirstSeen,
            fund: None,
            deployed: None,
            first_seen: Some(1_700_000_000),
            address: "0xaa".to_string(),
        });
        let sql = build_listing_sql(&query);
        assert!(sql.contains("first_seen < $2 OR (first_seen = $2 AND address > $3)"));
        assert!(sql.contains("ORDER BY first_seen DESC, address ASC"));
        assert!(sql.ends_with("LIMIT $4"));
    }

    #[test]
    fn test_listing_sql_named_only_filter() {
        let mut query = base_query(SortKey::Fund);
        query.named_only = true;
        let sql = build_listing_sql(&query);
        assert!(sql.contains("contract_name IS NOT NULL"));
    }

    #[test]
    fn test_upsert_preserves_enrichment_columns() {
        // a NULL in the payload must never erase what the row holds
        for column in ["code_hash", "contract_name", "deployed", "last_fund_updated"] {
            assert!(
                UPSERT_ADDRESS.contains(&format!(
                    "{column} = COALESCE(EXCLUDED.{column}, addresses.{column})"
                )),
                "{column} is not merge-preserved"
            );
        }
        assert!(UPSERT_ADDRESS.contains("first_seen = LEAST(addresses.first_seen, EXCLUDED.first_seen)"));
        assert!(UPSERT_ADDRESS.contains("last_updated = EXCLUDED.last_updated"));
        // empty or missing tag arrays keep the stored tags
        assert!(UPSERT_ADDRESS.contains("array_length(EXCLUDED.tags, 1) > 0"));
    }

    #[test]
    fn test_schema_covers_every_persisted_surface() {
        let ddl = SCHEMA.join("\n");
        for table in [
            "addresses",
            "symbol_prices",
            "network_log_density_stats",
            "chunk_optimizer_sessions",
            "scan_cursors",
            "helper_contracts",
            "network_address_counts",
            "mv_distinct_contracts",
        ] {
            assert!(ddl.contains(table), "{table} missing from the schema");
        }
        assert!(ddl.contains("UNIQUE (address, network)"));
        assert!(ddl.contains("USING GIN (tags)"));
    }
}
