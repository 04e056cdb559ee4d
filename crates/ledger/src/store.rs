//! [`ContributionLedger`]: the SQLite-backed store behind payout coordination.

use std::path::Path;
use std::sync::Mutex;

use encore_core::{
    now_millis, ArtistAmounts, ArtistSplits, ClaimStatus, PayoutId, PayoutStatus, Satoshis,
};
use rusqlite::{params, Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::allocation::allocate;
use crate::schema::init_schema;
use crate::{
    Allocation, Claim, LedgerError, LedgerEvent, NewClaim, Payout, Result, VerifiedClaim,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

const CLAIM_COLUMNS: &str =
    "tx_hash, payer_address, signature, confirmed_amount, status, payout_id, created_at";

struct Inner {
    conn: Connection,
    /// Id of the COLLECTING payout, once resolved.
    current_payout: Option<PayoutId>,
}

/// Changes made inside one write transaction, applied after commit.
struct Pending {
    current_payout: Option<PayoutId>,
    events: Vec<LedgerEvent>,
}

/// Ledger of claims, payouts and allocations.
///
/// Share it behind an `Arc`; all methods take `&self`.
pub struct ContributionLedger {
    inner: Mutex<Inner>,
    events: broadcast::Sender<LedgerEvent>,
}

impl ContributionLedger {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening ledger at {}", path.display());
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                current_payout: None,
            }),
            events,
        })
    }

    /// Committed changes, in commit order per writer.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    // ── Writes ──────────────────────────────────────────────

    /// The COLLECTING payout, created if none exists.
    pub fn get_or_create_collecting_payout(&self) -> Result<PayoutId> {
        self.write(collecting_payout)
    }

    /// Store a new UNVERIFIED claim. Returns `false` if the tx hash is known.
    pub fn insert_claim(&self, claim: &NewClaim) -> Result<bool> {
        if claim.tx_hash.is_empty() {
            return Err(LedgerError::InvalidClaim("empty tx hash".into()));
        }
        claim
            .to_message()
            .validate_splits()
            .map_err(|e| LedgerError::InvalidClaim(e.to_string()))?;

        self.write(|tx, pending| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO claims
                    (tx_hash, payer_address, signature, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    claim.tx_hash,
                    claim.payer_address,
                    claim.signature,
                    ClaimStatus::Unverified.as_str(),
                    now_millis()
                ],
            )?;
            if inserted == 0 {
                debug!(tx = %claim.tx_hash, "claim already known");
                return Ok(false);
            }

            let mut stmt = tx.prepare_cached(
                "INSERT INTO claim_splits (tx_hash, artist_address, share) VALUES (?1, ?2, ?3)",
            )?;
            for (artist, share) in &claim.artist_splits {
                stmt.execute(params![claim.tx_hash, artist, *share as f64])?;
            }

            pending.events.push(LedgerEvent::ClaimInserted {
                tx_hash: claim.tx_hash.clone(),
            });
            Ok(true)
        })
    }

    /// Mark an UNVERIFIED claim VERIFIED for `confirmed_amount` and credit its
    /// artists in the COLLECTING payout, atomically.
    pub fn verify_and_distribute(
        &self,
        tx_hash: &str,
        confirmed_amount: Satoshis,
    ) -> Result<VerifiedClaim> {
        self.write(|tx, pending| {
            let claim = load_claim(tx, tx_hash)?
                .ok_or_else(|| LedgerError::ClaimNotFound(tx_hash.to_string()))?;
            if claim.status != ClaimStatus::Unverified {
                return Err(LedgerError::InvalidState {
                    tx_hash: tx_hash.to_string(),
                    status: claim.status,
                });
            }
            if confirmed_amount <= 0 {
                return Err(LedgerError::InvalidAmount(confirmed_amount));
            }

            let payout_id = collecting_payout(tx, pending)?;
            tx.execute(
                "UPDATE claims SET status = ?1, confirmed_amount = ?2, payout_id = ?3
                 WHERE tx_hash = ?4",
                params![
                    ClaimStatus::Verified.as_str(),
                    confirmed_amount,
                    payout_id.to_string(),
                    tx_hash
                ],
            )?;

            let credited = allocate(&claim.artist_splits, confirmed_amount);
            let mut stmt = tx.prepare_cached(
                "INSERT INTO allocations (artist_address, payout_id, accrued_amount)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(artist_address, payout_id)
                 DO UPDATE SET accrued_amount = accrued_amount + excluded.accrued_amount",
            )?;
            for (artist, amount) in &credited {
                stmt.execute(params![artist, payout_id.to_string(), amount])?;
            }

            info!(
                tx = %tx_hash,
                payout = %payout_id,
                amount = confirmed_amount,
                artists = credited.len(),
                "claim verified"
            );
            pending.events.push(LedgerEvent::ClaimVerified {
                tx_hash: tx_hash.to_string(),
                payout_id,
                amount: confirmed_amount,
            });
            Ok(VerifiedClaim {
                tx_hash: tx_hash.to_string(),
                payout_id,
                confirmed_amount,
                credited,
            })
        })
    }

    /// UNVERIFIED → REJECTED. Rejected claims never receive allocations.
    pub fn reject_claim(&self, tx_hash: &str) -> Result<()> {
        self.write(|tx, pending| {
            let status = claim_status(tx, tx_hash)?
                .ok_or_else(|| LedgerError::ClaimNotFound(tx_hash.to_string()))?;
            if status != ClaimStatus::Unverified {
                return Err(LedgerError::InvalidState {
                    tx_hash: tx_hash.to_string(),
                    status,
                });
            }
            tx.execute(
                "UPDATE claims SET status = ?1 WHERE tx_hash = ?2",
                params![ClaimStatus::Rejected.as_str(), tx_hash],
            )?;
            warn!(tx = %tx_hash, "claim rejected");
            pending.events.push(LedgerEvent::ClaimRejected {
                tx_hash: tx_hash.to_string(),
            });
            Ok(())
        })
    }

    /// Move a payout to `next`.
    ///
    /// Leaving COLLECTING opens a fresh COLLECTING payout in the same
    /// transaction. SUBMITTED may fall back to AWAITING_CONFIRMATION only
    /// while no disbursement is recorded. Reaching COMPLETED requires a
    /// recorded disbursement and completes the payout's verified claims.
    pub fn advance_payout_stage(&self, payout_id: PayoutId, next: PayoutStatus) -> Result<PayoutStatus> {
        self.write(|tx, pending| {
            let payout = load_payout(tx, payout_id)?.ok_or(LedgerError::PayoutNotFound(payout_id))?;
            let from = payout.status;
            let reverting = from == PayoutStatus::Submitted && next == PayoutStatus::AwaitingConfirmation;
            if !from.can_transition_to(next) || (reverting && payout.disbursement_txid.is_some()) {
                return Err(LedgerError::InvalidTransition { from, to: next });
            }
            if next == PayoutStatus::Completed && payout.disbursement_txid.is_none() {
                return Err(LedgerError::DisbursementMissing(payout_id));
            }

            set_payout_status(tx, pending, payout_id, from, next)?;

            if from == PayoutStatus::Collecting {
                pending.current_payout = None;
                let fresh = create_payout(tx, pending)?;
                pending.current_payout = Some(fresh);
            }
            if next == PayoutStatus::Completed {
                let completed = tx.execute(
                    "UPDATE claims SET status = ?1 WHERE payout_id = ?2 AND status = ?3",
                    params![
                        ClaimStatus::Completed.as_str(),
                        payout_id.to_string(),
                        ClaimStatus::Verified.as_str()
                    ],
                )?;
                debug!(payout = %payout_id, claims = completed, "claims completed");
            }
            Ok(next)
        })
    }

    /// Attach the disbursement transaction to a SUBMITTED payout.
    /// Recording the same txid twice is a no-op.
    pub fn record_disbursement(&self, payout_id: PayoutId, txid: &str) -> Result<()> {
        self.write(|tx, _| {
            let payout = load_payout(tx, payout_id)?.ok_or(LedgerError::PayoutNotFound(payout_id))?;
            match payout.disbursement_txid.as_deref() {
                Some(existing) if existing == txid => return Ok(()),
                Some(_) => return Err(LedgerError::DisbursementRecorded(payout_id)),
                None => {}
            }
            if payout.status != PayoutStatus::Submitted {
                return Err(LedgerError::InvalidTransition {
                    from: payout.status,
                    to: PayoutStatus::Submitted,
                });
            }
            tx.execute(
                "UPDATE payouts SET disbursement_txid = ?1 WHERE id = ?2",
                params![txid, payout_id.to_string()],
            )?;
            info!(payout = %payout_id, txid = %txid, "disbursement recorded");
            Ok(())
        })
    }

    /// Revert SUBMITTED payouts that never got a disbursement txid, e.g. after
    /// a crash between submission and recording. Returns the reverted ids.
    pub fn recover_interrupted_submissions(&self) -> Result<Vec<PayoutId>> {
        self.write(|tx, pending| {
            let stuck: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM payouts WHERE status = ?1 AND disbursement_txid IS NULL",
                )?;
                let rows = stmt.query_map([PayoutStatus::Submitted.as_str()], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            let mut reverted = Vec::with_capacity(stuck.len());
            for raw in stuck {
                let id: PayoutId = raw.parse()?;
                set_payout_status(
                    tx,
                    pending,
                    id,
                    PayoutStatus::Submitted,
                    PayoutStatus::AwaitingConfirmation,
                )?;
                warn!(payout = %id, "reverted interrupted submission");
                reverted.push(id);
            }
            Ok(reverted)
        })
    }

    // ── Queries ─────────────────────────────────────────────

    pub fn claim(&self, tx_hash: &str) -> Result<Option<Claim>> {
        self.read(|conn| load_claim(conn, tx_hash))
    }

    pub fn claims_by_status(&self, status: ClaimStatus) -> Result<Vec<Claim>> {
        self.read(|conn| {
            query_claims(
                conn,
                "WHERE status = ?1 ORDER BY created_at, rowid",
                [status.as_str()],
            )
        })
    }

    pub fn claims_by_payout(&self, payout_id: PayoutId) -> Result<Vec<Claim>> {
        self.read(|conn| {
            query_claims(
                conn,
                "WHERE payout_id = ?1 ORDER BY created_at, rowid",
                [payout_id.to_string()],
            )
        })
    }

    pub fn allocations(&self, payout_id: PayoutId) -> Result<Vec<Allocation>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT artist_address, accrued_amount FROM allocations
                 WHERE payout_id = ?1 ORDER BY artist_address",
            )?;
            let rows = stmt.query_map([payout_id.to_string()], |row| {
                Ok(Allocation {
                    artist_address: row.get(0)?,
                    payout_id,
                    accrued_amount: row.get(1)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
    }

    /// Allocations of a payout keyed by artist, ready for a multi-output send.
    pub fn allocation_amounts(&self, payout_id: PayoutId) -> Result<ArtistAmounts> {
        Ok(self
            .allocations(payout_id)?
            .into_iter()
            .map(|a| (a.artist_address, a.accrued_amount))
            .collect())
    }

    pub fn payout(&self, payout_id: PayoutId) -> Result<Option<Payout>> {
        self.read(|conn| load_payout(conn, payout_id))
    }

    /// All payouts, newest first.
    pub fn payouts(&self) -> Result<Vec<Payout>> {
        self.read(|conn| {
            let ids: Vec<String> = {
                let mut stmt =
                    conn.prepare("SELECT id FROM payouts ORDER BY created_at DESC, rowid DESC")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            let mut payouts = Vec::with_capacity(ids.len());
            for raw in ids {
                let id: PayoutId = raw.parse()?;
                if let Some(payout) = load_payout(conn, id)? {
                    payouts.push(payout);
                }
            }
            Ok(payouts)
        })
    }

    /// The COLLECTING payout if one exists; never creates.
    pub fn current_payout(&self) -> Result<Option<Payout>> {
        self.read(|conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM payouts WHERE status = ?1",
                    [PayoutStatus::Collecting.as_str()],
                    |r| r.get(0),
                )
                .optional()?;
            match id {
                Some(raw) => load_payout(conn, raw.parse()?),
                None => Ok(None),
            }
        })
    }

    // ── Plumbing ────────────────────────────────────────────

    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>, &mut Pending) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let Inner {
            conn,
            current_payout,
        } = &mut *guard;

        let mut pending = Pending {
            current_payout: *current_payout,
            events: Vec::new(),
        };
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx, &mut pending)?;
        tx.commit()?;
        *current_payout = pending.current_payout;
        drop(guard);

        for event in pending.events {
            let _ = self.events.send(event);
        }
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        f(&guard.conn)
    }
}

fn collecting_payout(tx: &Transaction<'_>, pending: &mut Pending) -> Result<PayoutId> {
    if let Some(id) = pending.current_payout {
        if payout_status(tx, id)? == Some(PayoutStatus::Collecting) {
            return Ok(id);
        }
    }
    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM payouts WHERE status = ?1",
            [PayoutStatus::Collecting.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    let id = match existing {
        Some(raw) => raw.parse()?,
        None => create_payout(tx, pending)?,
    };
    pending.current_payout = Some(id);
    Ok(id)
}

fn create_payout(tx: &Transaction<'_>, pending: &mut Pending) -> Result<PayoutId> {
    let id = PayoutId::new();
    tx.execute(
        "INSERT INTO payouts (id, status, created_at) VALUES (?1, ?2, ?3)",
        params![id.to_string(), PayoutStatus::Collecting.as_str(), now_millis()],
    )?;
    info!(payout = %id, "new payout collecting");
    pending.events.push(LedgerEvent::PayoutCreated { payout_id: id });
    Ok(id)
}

fn set_payout_status(
    tx: &Transaction<'_>,
    pending: &mut Pending,
    payout_id: PayoutId,
    from: PayoutStatus,
    to: PayoutStatus,
) -> Result<()> {
    tx.execute(
        "UPDATE payouts SET status = ?1 WHERE id = ?2",
        params![to.as_str(), payout_id.to_string()],
    )?;
    info!(payout = %payout_id, %from, %to, "payout stage changed");
    pending.events.push(LedgerEvent::PayoutStatusChanged {
        payout_id,
        from,
        to,
    });
    Ok(())
}

fn payout_status(conn: &Connection, payout_id: PayoutId) -> Result<Option<PayoutStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM payouts WHERE id = ?1",
            [payout_id.to_string()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.map(|s| s.parse()).transpose()?)
}

fn claim_status(conn: &Connection, tx_hash: &str) -> Result<Option<ClaimStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM claims WHERE tx_hash = ?1",
            [tx_hash],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.map(|s| s.parse()).transpose()?)
}

fn load_payout(conn: &Connection, payout_id: PayoutId) -> Result<Option<Payout>> {
    let row: Option<(String, Option<String>, i64)> = conn
        .query_row(
            "SELECT status, disbursement_txid, created_at FROM payouts WHERE id = ?1",
            [payout_id.to_string()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((status, disbursement_txid, created_at)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT tx_hash FROM claims WHERE payout_id = ?1 AND status IN (?2, ?3) ORDER BY tx_hash",
    )?;
    let source_tx_hashes = stmt
        .query_map(
            params![
                payout_id.to_string(),
                ClaimStatus::Verified.as_str(),
                ClaimStatus::Completed.as_str()
            ],
            |r| r.get(0),
        )?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    Ok(Some(Payout {
        id: payout_id,
        status: status.parse()?,
        source_tx_hashes,
        disbursement_txid,
        created_at,
    }))
}

struct ClaimRow {
    tx_hash: String,
    payer_address: Option<String>,
    signature: String,
    confirmed_amount: Option<Satoshis>,
    status: String,
    payout_id: Option<String>,
    created_at: i64,
}

fn claim_row(row: &Row<'_>) -> rusqlite::Result<ClaimRow> {
    Ok(ClaimRow {
        tx_hash: row.get(0)?,
        payer_address: row.get(1)?,
        signature: row.get(2)?,
        confirmed_amount: row.get(3)?,
        status: row.get(4)?,
        payout_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn hydrate(conn: &Connection, row: ClaimRow) -> Result<Claim> {
    let artist_splits = load_splits(conn, &row.tx_hash)?;
    Ok(Claim {
        status: row.status.parse()?,
        payout_id: row.payout_id.map(|p| p.parse()).transpose()?,
        tx_hash: row.tx_hash,
        payer_address: row.payer_address,
        signature: row.signature,
        artist_splits,
        confirmed_amount: row.confirmed_amount,
        created_at: row.created_at,
    })
}

fn load_splits(conn: &Connection, tx_hash: &str) -> Result<ArtistSplits> {
    let mut stmt =
        conn.prepare_cached("SELECT artist_address, share FROM claim_splits WHERE tx_hash = ?1")?;
    let rows = stmt.query_map([tx_hash], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)? as f32))
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn load_claim(conn: &Connection, tx_hash: &str) -> Result<Option<Claim>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM claims WHERE tx_hash = ?1", CLAIM_COLUMNS),
            [tx_hash],
            claim_row,
        )
        .optional()?;
    row.map(|r| hydrate(conn, r)).transpose()
}

fn query_claims<P: Params>(conn: &Connection, clause: &str, params: P) -> Result<Vec<Claim>> {
    let rows: Vec<ClaimRow> = {
        let mut stmt = conn.prepare(&format!("SELECT {} FROM claims {}", CLAIM_COLUMNS, clause))?;
        let rows = stmt.query_map(params, claim_row)?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    rows.into_iter().map(|r| hydrate(conn, r)).collect()
}
