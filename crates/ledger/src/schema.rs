use rusqlite::Connection;

/// Create tables and indexes if missing.
pub(crate) fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS payouts (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            disbursement_txid TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_payouts_single_collecting
            ON payouts(status) WHERE status = 'COLLECTING';

        CREATE TABLE IF NOT EXISTS claims (
            tx_hash TEXT PRIMARY KEY,
            payer_address TEXT,
            signature TEXT NOT NULL,
            confirmed_amount INTEGER,
            status TEXT NOT NULL,
            payout_id TEXT REFERENCES payouts(id),
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_claims_status ON claims(status);
        CREATE INDEX IF NOT EXISTS idx_claims_payout ON claims(payout_id);

        CREATE TABLE IF NOT EXISTS claim_splits (
            tx_hash TEXT NOT NULL REFERENCES claims(tx_hash),
            artist_address TEXT NOT NULL,
            share REAL NOT NULL,
            PRIMARY KEY (tx_hash, artist_address)
        );

        CREATE TABLE IF NOT EXISTS allocations (
            artist_address TEXT NOT NULL,
            payout_id TEXT NOT NULL REFERENCES payouts(id),
            accrued_amount INTEGER NOT NULL,
            PRIMARY KEY (artist_address, payout_id)
        );",
    )
}
