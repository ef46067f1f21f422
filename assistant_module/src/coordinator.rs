//! Per-invocation driver: retry the failed-ID ledger, fetch candidates
//! after the cursor, feed each through the processor, aggregate failures
//! and advance the cursor. Message-level failures never abort the batch;
//! state-store corruption does.

use chrono::{NaiveDateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use gmail_module::client::MailSource;
use gmail_module::error::MailError;
use gmail_module::message::ThreadMessage;

use crate::processor::{MessageProcessor, Outcome};
use crate::service::ServiceConfig;
use crate::state_store::{
    load_cursor, load_failed_ledger, load_processed_ids, save_cursor, save_failed_ledger,
    save_processed_ids, CursorState, FailedLedger, StateStore,
};

const CURSOR_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A durable record is present but unreadable. The batch halts;
    /// silently resetting would risk reprocessing or losing history.
    #[error("state corruption: {0}")]
    StateCorruption(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("run failed: {0}")]
    Fatal(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub retried: usize,
    pub retried_succeeded: usize,
    pub fetched: usize,
    pub filtered: usize,
    pub booked: usize,
    pub clarified: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// One webhook-triggered pass. `is_system` is the replaceable
/// system/notification-mail policy.
pub fn run_once(
    config: &ServiceConfig,
    store: &StateStore,
    mail: &dyn MailSource,
    processor: &MessageProcessor<'_>,
    is_system: &dyn Fn(&ThreadMessage, &str) -> bool,
) -> Result<RunSummary, RunError> {
    let mut summary = RunSummary::default();

    let mut ledger = match load_failed_ledger(store) {
        Ok(ledger) => ledger,
        Err(err) => {
            alert_operator(
                mail,
                &config.alert_email,
                "Alert: failed-ID ledger unavailable",
                &format!(
                    "The failed-ID ledger could not be read.\nError: {err}\n\n\
This may indicate a write failure or manual modification.\n\
The run was aborted to prevent data inconsistency."
                ),
            );
            return Err(RunError::StateCorruption(err.to_string()));
        }
    };

    let mut processed = load_processed_ids(store);

    if !ledger.is_empty() {
        info!("retrying {} previously failed messages", ledger.len());
        for entry in ledger.entries().to_vec() {
            summary.retried += 1;
            let msg = match mail.get(&entry.msg_id) {
                Ok(msg) => msg,
                Err(MailError::Auth(detail)) => {
                    alert_operator(
                        mail,
                        &config.alert_email,
                        "Alert: mail credential rejected",
                        &format!("Fetching a message failed with an auth error: {detail}"),
                    );
                    return Err(RunError::Auth(detail));
                }
                Err(err) => {
                    warn!("failed to re-fetch {}: {}", entry.msg_id, err);
                    ledger.record(&entry.msg_id, &format!("refetch: {err}"), &now_stamp());
                    continue;
                }
            };
            match processor.process(&msg) {
                Outcome::Error { reason, .. } => {
                    warn!("retry of {} failed again: {}", entry.msg_id, reason);
                    ledger.record(&entry.msg_id, &reason, &now_stamp());
                }
                outcome => {
                    ledger.remove(&entry.msg_id);
                    summary.retried_succeeded += 1;
                    finalize_handled(mail, &mut processed, outcome.msg_id());
                    tally(&mut summary, &outcome);
                }
            }
        }
        info!(
            "retry pass done: {} succeeded, {} still pending",
            summary.retried_succeeded,
            ledger.len()
        );
    }

    let cursor = match load_cursor(store) {
        Ok(cursor) => cursor,
        Err(err) => {
            alert_operator(
                mail,
                &config.alert_email,
                "Alert: fetch cursor unreadable",
                &format!(
                    "The cursor record could not be read.\nError: {err}\n\n\
The run was aborted to prevent reprocessing already-handled mail."
                ),
            );
            return Err(RunError::StateCorruption(err.to_string()));
        }
    };

    let after = match &cursor {
        Some(cursor) => match parse_cursor_timestamp(&cursor.updated_at, config) {
            Some(after) => {
                info!(
                    "resuming after history_id={} updated_at={}",
                    cursor.last_history_id, cursor.updated_at
                );
                after
            }
            None => {
                return Err(RunError::StateCorruption(format!(
                    "cursor updated_at '{}' is not a valid timestamp",
                    cursor.updated_at
                )))
            }
        },
        None => {
            let after = Utc::now().timestamp() - config.first_run_lookback.as_secs() as i64;
            info!(
                "first run: fetching messages from the last {}s",
                config.first_run_lookback.as_secs()
            );
            after
        }
    };

    let candidates = match mail.list_candidates(Some(after)) {
        Ok(candidates) => candidates,
        Err(err) => {
            persist_ledger(store, mail, config, &ledger)?;
            if let MailError::Auth(detail) = &err {
                alert_operator(
                    mail,
                    &config.alert_email,
                    "Alert: mail credential rejected",
                    &format!("Listing candidate messages failed with an auth error: {detail}"),
                );
                return Err(RunError::Auth(detail.clone()));
            }
            return Err(RunError::Fatal(err.to_string()));
        }
    };
    summary.fetched = candidates.len();

    if candidates.is_empty() {
        info!("no new messages found");
        persist_ledger(store, mail, config, &ledger)?;
        if let Err(err) = save_processed_ids(store, &processed) {
            warn!("failed to save processed ids: {}", err);
        }
        advance_cursor(store, mail, config);
        return Ok(summary);
    }

    for msg in &candidates {
        if is_system(msg, &config.my_email) {
            info!("skip system/notification email msg_id={}", msg.id);
            summary.filtered += 1;
            continue;
        }
        if processed.contains(&msg.id) {
            debug!("msg_id={} already processed; skipping", msg.id);
            summary.skipped += 1;
            continue;
        }
        let outcome = processor.process(msg);
        match &outcome {
            Outcome::Error { msg_id, reason } => {
                summary.failed += 1;
                ledger.record(msg_id, reason, &now_stamp());
            }
            other => {
                finalize_handled(mail, &mut processed, other.msg_id());
                tally(&mut summary, other);
            }
        }
    }

    if summary.failed > 0 {
        warn!(
            "{} messages failed this run; ledger holds {} entries",
            summary.failed,
            ledger.len()
        );
    } else {
        info!("all messages processed successfully");
    }

    persist_ledger(store, mail, config, &ledger)?;
    if let Err(err) = save_processed_ids(store, &processed) {
        warn!("failed to save processed ids: {}", err);
    }
    advance_cursor(store, mail, config);
    Ok(summary)
}

fn tally(summary: &mut RunSummary, outcome: &Outcome) {
    match outcome {
        Outcome::Success { .. } => summary.booked += 1,
        Outcome::Clarify { .. } => summary.clarified += 1,
        Outcome::Skipped { .. } => summary.skipped += 1,
        Outcome::Error { .. } => summary.failed += 1,
    }
}

fn finalize_handled(
    mail: &dyn MailSource,
    processed: &mut std::collections::BTreeSet<String>,
    msg_id: &str,
) {
    if let Err(err) = mail.mark_processed(msg_id, true) {
        warn!("failed to label {} as processed: {}", msg_id, err);
    }
    processed.insert(msg_id.to_string());
}

fn persist_ledger(
    store: &StateStore,
    mail: &dyn MailSource,
    config: &ServiceConfig,
    ledger: &FailedLedger,
) -> Result<(), RunError> {
    save_failed_ledger(store, ledger).map_err(|err| {
        alert_operator(
            mail,
            &config.alert_email,
            "Alert: failed-ID ledger write error",
            &format!(
                "Writing the failed-ID ledger failed.\nError: {err}\n\n\
The run was aborted to avoid partial state writes."
            ),
        );
        RunError::StateCorruption(err.to_string())
    })
}

/// Advance the cursor to the provider's current high-water mark. Runs
/// unconditionally at the end of a pass, including empty ones.
fn advance_cursor(store: &StateStore, mail: &dyn MailSource, config: &ServiceConfig) {
    let history_id = match mail.current_high_water_mark() {
        Ok(history_id) => history_id,
        Err(err) => {
            warn!("failed to get latest history id; cursor not advanced: {}", err);
            return;
        }
    };
    let cursor = CursorState {
        last_history_id: history_id.clone(),
        updated_at: Utc::now()
            .with_timezone(&config.default_tz)
            .format(CURSOR_TIMESTAMP_FORMAT)
            .to_string(),
    };
    match save_cursor(store, &cursor) {
        Ok(()) => info!("cursor advanced to history_id={}", history_id),
        Err(err) => warn!("failed to save cursor: {}", err),
    }
}

fn parse_cursor_timestamp(raw: &str, config: &ServiceConfig) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(raw, CURSOR_TIMESTAMP_FORMAT).ok()?;
    config
        .default_tz
        .from_local_datetime(&naive)
        .earliest()
        .map(|instant| instant.timestamp())
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339()
}

fn alert_operator(mail: &dyn MailSource, alert_email: &str, subject: &str, body: &str) {
    match mail.send_reply(None, alert_email, subject, body, None) {
        Ok(true) => warn!("operator alert sent: {}", subject),
        Ok(false) => warn!("operator alert dropped (no usable recipient): {}", subject),
        Err(err) => warn!("failed to send operator alert '{}': {}", subject, err),
    }
}
