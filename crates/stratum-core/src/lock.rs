//! Advisory run-lock serializing migration batches.
//!
//! SQLite has no advisory locks, so the lock is a row in a bookkeeping table.
//! Whoever inserts the row holds the lock until they delete it or stop
//! renewing its lease. An expired lease means the holder died without
//! releasing, and the next runner takes the lock over.

use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::LockConfig;
use crate::error::{MigrationError, Result};

/// Name of the lock table.
pub const LOCK_TABLE: &str = "_stratum_lock";

/// Current owner of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// Opaque holder identifier.
    pub holder: String,
    /// When the lock was taken, as stored.
    pub acquired_at: String,
    /// When the lock lapses unless renewed, as stored.
    pub expires_at: String,
}

/// Proof of ownership used to keep a held lock alive.
#[derive(Debug, Clone)]
pub struct LockLease {
    name: String,
    holder: String,
    lease: Duration,
}

impl LockLease {
    /// Push the expiry out by one lease period.
    ///
    /// Fails with [`MigrationError::LockLost`] if another runner has taken
    /// the lock over.
    pub fn renew(&self, conn: &Connection) -> Result<()> {
        let renewed = conn.execute(
            &format!("UPDATE {LOCK_TABLE} SET expires_at = ?1 WHERE name = ?2 AND holder = ?3"),
            params![timestamp(expiry(Utc::now(), self.lease)), self.name, self.holder],
        )?;
        if renewed == 0 {
            tracing::error!(lock = %self.name, "run-lock lost");
            return Err(MigrationError::LockLost {
                lock: self.name.clone(),
            });
        }
        tracing::trace!(lock = %self.name, "run-lock renewed");
        Ok(())
    }
}

/// A held run-lock. Released on drop.
pub struct RunLock<'c> {
    conn: &'c Connection,
    lease: LockLease,
    released: bool,
}

impl<'c> RunLock<'c> {
    /// Acquire the lock, waiting up to `config.timeout`.
    pub fn acquire(conn: &'c Connection, config: &LockConfig) -> Result<Self> {
        let started = Instant::now();
        bootstrap(conn)?;

        let holder = uuid::Uuid::new_v4().to_string();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let attempt = try_insert(conn, &config.name, &holder, config.lease).and_then(|inserted| {
                if inserted {
                    Ok(true)
                } else {
                    try_take_over(conn, &config.name, &holder, config.lease)
                }
            });
            match attempt {
                Ok(true) => {
                    tracing::debug!(lock = %config.name, holder = %holder, attempts, "run-lock acquired");
                    return Ok(Self {
                        conn,
                        lease: LockLease {
                            name: config.name.clone(),
                            holder,
                            lease: config.lease,
                        },
                        released: false,
                    });
                }
                Ok(false) => {}
                Err(e) if MigrationError::is_busy(&e) => {}
                Err(e) => return Err(e.into()),
            }

            let waited = started.elapsed();
            if waited >= config.timeout {
                tracing::warn!(lock = %config.name, ?waited, "timed out waiting for run-lock");
                return Err(MigrationError::LockTimeout {
                    lock: config.name.clone(),
                    waited,
                });
            }
            if attempts == 1 {
                tracing::info!(lock = %config.name, "run-lock is held elsewhere, waiting");
            }
            std::thread::sleep(config.poll_interval.min(config.timeout - waited));
        }
    }

    /// Lock name.
    pub fn name(&self) -> &str {
        &self.lease.name
    }

    /// A handle for renewing this lock from code that only sees the connection.
    pub fn lease(&self) -> LockLease {
        self.lease.clone()
    }

    /// Extend the lock by one lease period.
    pub fn renew(&self) -> Result<()> {
        self.lease.renew(self.conn)
    }

    /// Release the lock.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    /// Remove the lock regardless of who holds it. Returns whether one was held.
    pub fn force_release(conn: &Connection, name: &str) -> Result<bool> {
        bootstrap(conn)?;
        let removed = conn.execute(&format!("DELETE FROM {LOCK_TABLE} WHERE name = ?1"), [name])?;
        if removed > 0 {
            tracing::warn!(lock = name, "run-lock force-released");
        }
        Ok(removed > 0)
    }

    /// Who holds the lock, if anyone.
    pub fn current_holder(conn: &Connection, name: &str) -> Result<Option<LockHolder>> {
        bootstrap(conn)?;
        let holder = conn
            .query_row(
                &format!("SELECT holder, acquired_at, expires_at FROM {LOCK_TABLE} WHERE name = ?1"),
                [name],
                |row| {
                    Ok(LockHolder {
                        holder: row.get(0)?,
                        acquired_at: row.get(1)?,
                        expires_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(holder)
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.conn.execute(
            &format!("DELETE FROM {LOCK_TABLE} WHERE name = ?1 AND holder = ?2"),
            [&self.lease.name, &self.lease.holder],
        )?;
        self.released = true;
        tracing::debug!(lock = %self.lease.name, "run-lock released");
        Ok(())
    }
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::error!(lock = %self.lease.name, error = %e, "failed to release run-lock");
        }
    }
}

fn bootstrap(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (\n\
             name TEXT PRIMARY KEY,\n\
             holder TEXT NOT NULL,\n\
             acquired_at TEXT NOT NULL,\n\
             expires_at TEXT NOT NULL\n\
         )"
    ))?;
    Ok(())
}

fn try_insert(conn: &Connection, name: &str, holder: &str, lease: Duration) -> rusqlite::Result<bool> {
    let now = Utc::now();
    let inserted = conn.execute(
        &format!(
            "INSERT INTO {LOCK_TABLE} (name, holder, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(name) DO NOTHING"
        ),
        params![name, holder, timestamp(now), timestamp(expiry(now, lease))],
    )?;
    Ok(inserted == 1)
}

/// Take the lock from a holder whose lease has run out.
///
/// The swap only succeeds if the row still carries the expiry we read, so a
/// holder that renews in the meantime keeps its lock.
fn try_take_over(conn: &Connection, name: &str, holder: &str, lease: Duration) -> rusqlite::Result<bool> {
    let current: Option<(String, String)> = conn
        .query_row(
            &format!("SELECT holder, expires_at FROM {LOCK_TABLE} WHERE name = ?1"),
            [name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((previous, expires_at)) = current else {
        return Ok(false);
    };

    let now = Utc::now();
    let expired = match DateTime::parse_from_rfc3339(&expires_at) {
        Ok(at) => at.with_timezone(&Utc) <= now,
        Err(_) => true,
    };
    if !expired {
        return Ok(false);
    }

    let taken = conn.execute(
        &format!(
            "UPDATE {LOCK_TABLE} SET holder = ?1, acquired_at = ?2, expires_at = ?3 \
             WHERE name = ?4 AND holder = ?5 AND expires_at = ?6"
        ),
        params![
            holder,
            timestamp(now),
            timestamp(expiry(now, lease)),
            name,
            previous,
            expires_at
        ],
    )?;
    if taken == 1 {
        tracing::warn!(lock = name, previous = %previous, expired_at = %expires_at, "took over expired run-lock");
    }
    Ok(taken == 1)
}

fn expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
