use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{params, Connection, OptionalExtension as _, Row};

use crate::monero::Subaddress;

use super::{InvoiceRecord, InvoiceState};

/// Durable invoice storage. An in-flight invoice's deadlines, subaddress and
/// observed balance survive a process restart.
#[derive(Debug)]
pub struct SqliteInvoiceStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteInvoiceStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create invoice store dir {}", dir.display()))?;
            }
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_invoice(&mut self, record: &InvoiceRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO invoices (
  id,
  bolt11,
  payment_hash,
  description,
  refund_address,
  amount_msat,
  fee_bps,
  rate_pico_per_sat,
  xmr_amount_due,
  subaddress,
  subaddress_index,
  observed_balance,
  created_at,
  quote_expires_at,
  payment_expires_at,
  terminal_at,
  state,
  attention,
  released
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
)
"#,
                params![
                    &record.id,
                    &record.bolt11,
                    &record.payment_hash,
                    &record.description,
                    &record.refund_address,
                    record.amount_msat,
                    record.fee_bps,
                    record.rate_pico_per_sat,
                    record.xmr_amount_due,
                    record.subaddress.as_ref().map(|s| s.address.clone()),
                    record.subaddress.as_ref().map(|s| s.minor_index),
                    record.observed_balance,
                    record.created_at,
                    record.quote_expires_at,
                    record.payment_expires_at,
                    record.terminal_at,
                    state_to_str(record.state),
                    record.attention,
                    record.released,
                ],
            )
            .with_context(|| format!("insert invoice {}", record.id))?;
        Ok(())
    }

    pub fn get_invoice(&self, id: &str) -> Result<Option<InvoiceRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM invoices WHERE id = ?1"),
                params![id],
                row_to_invoice,
            )
            .optional()
            .with_context(|| format!("get invoice {id}"))
    }

    pub fn update_state(
        &mut self,
        id: &str,
        state: InvoiceState,
        terminal_at: Option<u64>,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE invoices SET state = ?2, terminal_at = COALESCE(?3, terminal_at) WHERE id = ?1",
                params![id, state_to_str(state), terminal_at],
            )
            .with_context(|| format!("update invoice state {id}"))?;
        anyhow::ensure!(rows == 1, "invoice not found: {id}");
        Ok(())
    }

    /// Commit the acceptance outcome: assigned subaddress, settlement
    /// deadline and the Monitoring state, in one statement.
    pub fn set_monitoring(
        &mut self,
        id: &str,
        subaddress: &Subaddress,
        payment_expires_at: u64,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                r#"
UPDATE invoices
SET subaddress = ?2, subaddress_index = ?3, payment_expires_at = ?4, state = ?5
WHERE id = ?1
"#,
                params![
                    id,
                    &subaddress.address,
                    subaddress.minor_index,
                    payment_expires_at,
                    state_to_str(InvoiceState::Monitoring),
                ],
            )
            .with_context(|| format!("set invoice monitoring {id}"))?;
        anyhow::ensure!(rows == 1, "invoice not found: {id}");
        Ok(())
    }

    pub fn update_observed_balance(&mut self, id: &str, observed_balance: u64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE invoices SET observed_balance = ?2 WHERE id = ?1",
                params![id, observed_balance],
            )
            .with_context(|| format!("update invoice balance {id}"))?;
        anyhow::ensure!(rows == 1, "invoice not found: {id}");
        Ok(())
    }

    pub fn set_attention(&mut self, id: &str) -> Result<()> {
        let rows = self
            .conn
            .execute("UPDATE invoices SET attention = 1 WHERE id = ?1", params![id])
            .with_context(|| format!("flag invoice {id}"))?;
        anyhow::ensure!(rows == 1, "invoice not found: {id}");
        Ok(())
    }

    pub fn mark_released(&mut self, id: &str) -> Result<()> {
        let rows = self
            .conn
            .execute("UPDATE invoices SET released = 1 WHERE id = ?1", params![id])
            .with_context(|| format!("mark invoice released {id}"))?;
        anyhow::ensure!(rows == 1, "invoice not found: {id}");
        Ok(())
    }

    /// Invoices that still need a timer or poller after a restart.
    pub fn list_in_flight(&self) -> Result<Vec<InvoiceRecord>> {
        self.list_where("state IN ('quoted', 'accepted', 'monitoring')")
    }

    /// Settled invoices whose subaddress is due back in the pool: terminal
    /// with funds, unreleased, past the grace cutoff.
    pub fn list_release_due(&self, terminal_cutoff: u64) -> Result<Vec<InvoiceRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                r#"
SELECT {COLUMNS} FROM invoices
WHERE state IN ('paid', 'overpaid', 'underpaid_expired')
  AND released = 0
  AND subaddress IS NOT NULL
  AND terminal_at <= ?1
ORDER BY terminal_at
"#
            ))
            .context("prepare list release due")?;

        let rows = stmt
            .query_map(params![terminal_cutoff], row_to_invoice)
            .context("query release due")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read invoice row")?);
        }
        Ok(out)
    }

    fn list_where(&self, predicate: &str) -> Result<Vec<InvoiceRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM invoices WHERE {predicate} ORDER BY created_at, rowid"
            ))
            .context("prepare list invoices")?;

        let rows = stmt
            .query_map([], row_to_invoice)
            .context("query list invoices")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read invoice row")?);
        }
        Ok(out)
    }
}

const COLUMNS: &str = r#"
  id,
  bolt11,
  payment_hash,
  description,
  refund_address,
  amount_msat,
  fee_bps,
  rate_pico_per_sat,
  xmr_amount_due,
  subaddress,
  subaddress_index,
  observed_balance,
  created_at,
  quote_expires_at,
  payment_expires_at,
  terminal_at,
  state,
  attention,
  released
"#;

fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(idx)?;
    u64::try_from(v).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            format!("negative integer {v}").into(),
        )
    })
}

fn get_opt_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let v: Option<i64> = row.get(idx)?;
    v.map(|v| {
        u64::try_from(v).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Integer,
                format!("negative integer {v}").into(),
            )
        })
    })
    .transpose()
}

fn row_to_invoice(row: &Row<'_>) -> rusqlite::Result<InvoiceRecord> {
    let state_str: String = row.get(16)?;
    let fee_bps: i64 = row.get(6)?;
    let sub_address: Option<String> = row.get(9)?;
    let sub_index: Option<i64> = row.get(10)?;

    let subaddress = match (sub_address, sub_index) {
        (Some(address), Some(minor_index)) => Some(Subaddress {
            address,
            minor_index: u32::try_from(minor_index).map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    10,
                    rusqlite::types::Type::Integer,
                    format!("invalid subaddress_index {minor_index}").into(),
                )
            })?,
        }),
        _ => None,
    };

    Ok(InvoiceRecord {
        id: row.get(0)?,
        bolt11: row.get(1)?,
        payment_hash: row.get(2)?,
        description: row.get(3)?,
        refund_address: row.get(4)?,
        amount_msat: get_u64(row, 5)?,
        fee_bps: u32::try_from(fee_bps).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Integer,
                format!("invalid fee_bps {fee_bps}").into(),
            )
        })?,
        rate_pico_per_sat: get_u64(row, 7)?,
        xmr_amount_due: get_u64(row, 8)?,
        subaddress,
        observed_balance: get_u64(row, 11)?,
        created_at: get_u64(row, 12)?,
        quote_expires_at: get_u64(row, 13)?,
        payment_expires_at: get_opt_u64(row, 14)?,
        terminal_at: get_opt_u64(row, 15)?,
        state: state_from_str(&state_str, 16)?,
        attention: row.get(17)?,
        released: row.get(18)?,
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS invoices (
  id TEXT PRIMARY KEY,
  bolt11 TEXT NOT NULL,
  payment_hash TEXT NOT NULL,
  description TEXT NOT NULL,
  refund_address TEXT NOT NULL,
  amount_msat INTEGER NOT NULL,
  fee_bps INTEGER NOT NULL,
  rate_pico_per_sat INTEGER NOT NULL,
  xmr_amount_due INTEGER NOT NULL,
  subaddress TEXT,
  subaddress_index INTEGER,
  observed_balance INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL,
  quote_expires_at INTEGER NOT NULL,
  payment_expires_at INTEGER,
  terminal_at INTEGER,
  state TEXT NOT NULL,
  attention INTEGER NOT NULL DEFAULT 0,
  released INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS invoices_state_idx ON invoices(state);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn state_to_str(state: InvoiceState) -> &'static str {
    match state {
        InvoiceState::Quoted => "quoted",
        InvoiceState::Accepted => "accepted",
        InvoiceState::Monitoring => "monitoring",
        InvoiceState::Paid => "paid",
        InvoiceState::Overpaid => "overpaid",
        InvoiceState::UnderpaidExpired => "underpaid_expired",
        InvoiceState::Expired => "expired",
        InvoiceState::Rejected => "rejected",
    }
}

fn state_from_str(s: &str, col: usize) -> rusqlite::Result<InvoiceState> {
    match s {
        "quoted" => Ok(InvoiceState::Quoted),
        "accepted" => Ok(InvoiceState::Accepted),
        "monitoring" => Ok(InvoiceState::Monitoring),
        "paid" => Ok(InvoiceState::Paid),
        "overpaid" => Ok(InvoiceState::Overpaid),
        "underpaid_expired" => Ok(InvoiceState::UnderpaidExpired),
        "expired" => Ok(InvoiceState::Expired),
        "rejected" => Ok(InvoiceState::Rejected),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown invoice state: {other}").into(),
        )),
    }
}
