//! Failure classification and the transactional retry wrapper.
//!
//! Every store operation runs through [`run_in_transaction`], which begins a
//! transaction, runs the operation closure, commits, and on failure consults
//! a driver-agnostic classification table to decide between retry (deadlock,
//! transient) and immediate surfacing (constraint violation, anything else).

use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;

use choreo_core::DbError;

// ── Failure signal & classification ──────────────────────────

/// Normalized view of a database failure: SQLSTATE-ish code, lowercase
/// message, and the violated constraint when the driver reports one.
#[derive(Debug, Clone)]
pub struct FailureSignal {
    pub code: Option<String>,
    pub message: String,
    pub constraint: Option<String>,
}

impl FailureSignal {
    pub fn from_sqlx(e: &sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) => Self {
                code: db.code().map(|c| c.to_string()),
                message: db.message().to_lowercase(),
                constraint: db.constraint().map(str::to_string),
            },
            sqlx::Error::Io(io) => Self {
                code: None,
                message: format!("io error: {}", io).to_lowercase(),
                constraint: None,
            },
            sqlx::Error::PoolTimedOut => Self {
                code: None,
                message: "connection pool timed out".to_string(),
                constraint: None,
            },
            other => Self {
                code: None,
                message: other.to_string().to_lowercase(),
                constraint: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Deadlock,
    Constraint,
    Transient,
    Other,
}

/// One classification rule: a class plus the codes/message fragments that
/// select it. Evaluated in order; first match wins.
struct Rule {
    class: FailureClass,
    codes: &'static [&'static str],
    needles: &'static [&'static str],
}

const RULES: &[Rule] = &[
    Rule {
        class: FailureClass::Deadlock,
        // Postgres deadlock/serialization, MySQL ER_LOCK_DEADLOCK.
        codes: &["40P01", "40001", "1213"],
        needles: &["deadlock"],
    },
    Rule {
        class: FailureClass::Constraint,
        // Postgres FK/unique, MySQL FK/duplicate-entry, SQLite messages.
        codes: &["23503", "23505", "1452", "1062"],
        needles: &[
            "foreign key constraint",
            "unique constraint",
            "duplicate key",
        ],
    },
    Rule {
        class: FailureClass::Transient,
        codes: &["57P01", "08000", "08001", "08004", "08006"],
        needles: &[
            "connection reset",
            "connection refused",
            "connection closed",
            "broken pipe",
            "timed out",
            "timeout",
        ],
    },
];

/// Map a normalized failure signal to its retry class.
pub fn classify(signal: &FailureSignal) -> FailureClass {
    for rule in RULES {
        if let Some(code) = &signal.code {
            if rule.codes.iter().any(|c| c.eq_ignore_ascii_case(code)) {
                return rule.class;
            }
        }
        if rule.needles.iter().any(|n| signal.message.contains(n)) {
            return rule.class;
        }
    }
    FailureClass::Other
}

// ── Retry policy ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub deadlock_base: Duration,
    pub deadlock_cap: Duration,
    pub transient_base: Duration,
    pub transient_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            deadlock_base: Duration::from_millis(100),
            deadlock_cap: Duration::from_secs(2),
            transient_base: Duration::from_millis(500),
            transient_cap: Duration::from_secs(5),
        }
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(cap)
}

// ── Retry loop ────────────────────────────────────────────────

/// Drive `attempt_fn` until success, a non-retryable failure, or attempt
/// exhaustion. Logs one warning per retried failure.
pub async fn retry_loop<T, F, Fut>(
    operation: &'static str,
    policy: &RetryPolicy,
    mut attempt_fn: F,
) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt: u32 = 1;
    loop {
        let err = match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let signal = FailureSignal::from_sqlx(&err);
        match classify(&signal) {
            FailureClass::Deadlock => {
                if attempt >= policy.max_attempts {
                    return Err(DbError::Deadlock {
                        operation,
                        attempts: attempt,
                    });
                }
                let delay = backoff_delay(policy.deadlock_base, policy.deadlock_cap, attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transaction deadlocked — retrying"
                );
                tokio::time::sleep(delay).await;
            }
            FailureClass::Transient => {
                if attempt >= policy.max_attempts {
                    return Err(DbError::Transient {
                        operation,
                        attempts: attempt,
                        message: signal.message,
                    });
                }
                let delay = backoff_delay(policy.transient_base, policy.transient_cap, attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %signal.message,
                    "transient database failure — retrying"
                );
                tokio::time::sleep(delay).await;
            }
            FailureClass::Constraint => {
                return Err(DbError::ConstraintViolation {
                    constraint: signal
                        .constraint
                        .unwrap_or_else(|| signal.message.clone()),
                });
            }
            FailureClass::Other => {
                return Err(DbError::Transaction {
                    operation,
                    message: err.to_string(),
                });
            }
        }
        attempt += 1;
    }
}

/// Run `f` inside a transaction with retry-on-deadlock/transient semantics.
///
/// The closure may run multiple times; each attempt gets a fresh
/// transaction, and the commit itself is inside the retried section.
pub async fn run_in_transaction<T, F>(
    pool: &PgPool,
    operation: &'static str,
    policy: &RetryPolicy,
    f: F,
) -> Result<T, DbError>
where
    F: for<'t> Fn(&'t mut Transaction<'static, Postgres>) -> BoxFuture<'t, Result<T, sqlx::Error>>,
{
    let f = &f;
    retry_loop(operation, policy, || {
        let pool = pool.clone();
        async move {
            let mut tx = pool.begin().await?;
            let value = f(&mut tx).await?;
            tx.commit().await?;
            Ok(value)
        }
    })
    .await
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn signal(code: Option<&str>, message: &str) -> FailureSignal {
        FailureSignal {
            code: code.map(String::from),
            message: message.to_lowercase(),
            constraint: None,
        }
    }

    #[test]
    fn test_classify_deadlock_by_code_and_message() {
        assert_eq!(
            classify(&signal(Some("40P01"), "some driver text")),
            FailureClass::Deadlock
        );
        assert_eq!(
            classify(&signal(Some("1213"), "lock wait")),
            FailureClass::Deadlock
        );
        assert_eq!(
            classify(&signal(None, "deadlock detected")),
            FailureClass::Deadlock
        );
    }

    #[test]
    fn test_classify_constraint() {
        assert_eq!(
            classify(&signal(Some("23505"), "duplicate key value")),
            FailureClass::Constraint
        );
        assert_eq!(
            classify(&signal(None, "FOREIGN KEY constraint failed")),
            FailureClass::Constraint
        );
    }

    #[test]
    fn test_classify_transient() {
        assert_eq!(
            classify(&signal(Some("57P01"), "terminating connection")),
            FailureClass::Transient
        );
        assert_eq!(
            classify(&signal(None, "connection reset by peer")),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(
            classify(&signal(Some("42601"), "syntax error at or near")),
            FailureClass::Other
        );
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, cap, 5), Duration::from_millis(1600));
        assert_eq!(backoff_delay(base, cap, 6), cap);
        assert_eq!(backoff_delay(base, cap, 60), cap);
    }

    #[tokio::test]
    async fn test_retry_loop_recovers_from_two_deadlocks() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            deadlock_base: Duration::from_millis(1),
            ..RetryPolicy::default()
        };

        let result = retry_loop("test_op", &policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(sqlx::Error::Protocol("deadlock detected".to_string()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_loop_exhausts_deadlocks() {
        let policy = RetryPolicy {
            deadlock_base: Duration::from_millis(1),
            ..RetryPolicy::default()
        };

        let result: Result<(), _> = retry_loop("exhausted_op", &policy, || async {
            Err(sqlx::Error::Protocol("deadlock detected".to_string()))
        })
        .await;

        match result.unwrap_err() {
            DbError::Deadlock {
                operation,
                attempts,
            } => {
                assert_eq!(operation, "exhausted_op");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Deadlock, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_loop_never_retries_other() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: Result<(), _> = retry_loop("broken_op", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::Protocol("syntax error".to_string())) }
        })
        .await;

        assert!(matches!(
            result.unwrap_err(),
            DbError::Transaction { operation: "broken_op", .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
