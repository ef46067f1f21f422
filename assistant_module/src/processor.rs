//! Per-message orchestration: gate, analyze, then either ask the
//! participants to clarify or book the calendar event. One pass per
//! message and no internal retries; the coordinator decides whether a
//! message that ended in `Error` is attempted again on a later run.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use analysis_module::decision::DecisionStatus;
use analysis_module::resolver::ScheduleAnalyzer;
use analysis_module::time::{parse_human_time, sender_timezone};
use gmail_module::client::MailSource;
use gmail_module::message::{clean_email_address, ThreadMessage};

use crate::calendar::{CalendarSink, CreateOutcome, EventRequest};
use crate::service::BoxError;

const BODY_QUOTE_LIMIT: usize = 8000;
const CONFIRMATION_KEYWORDS: [&str; 2] = ["confirm", "confirmation"];

/// Terminal result of one processing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success {
        msg_id: String,
        event_id: String,
        summary: String,
        meeting_time: String,
        attendees: Vec<String>,
        meet_link: Option<String>,
    },
    Clarify {
        msg_id: String,
        reason: String,
    },
    Skipped {
        msg_id: String,
        reason: String,
    },
    Error {
        msg_id: String,
        reason: String,
    },
}

impl Outcome {
    pub fn msg_id(&self) -> &str {
        match self {
            Outcome::Success { msg_id, .. }
            | Outcome::Clarify { msg_id, .. }
            | Outcome::Skipped { msg_id, .. }
            | Outcome::Error { msg_id, .. } => msg_id,
        }
    }
}

pub struct MessageProcessor<'a> {
    analyzer: &'a ScheduleAnalyzer,
    calendar: &'a dyn CalendarSink,
    mail: &'a dyn MailSource,
    my_email: String,
    default_tz: Tz,
    send_meeting_invite: bool,
    send_meeting_reply: bool,
}

impl<'a> MessageProcessor<'a> {
    pub fn new(
        analyzer: &'a ScheduleAnalyzer,
        calendar: &'a dyn CalendarSink,
        mail: &'a dyn MailSource,
        my_email: impl Into<String>,
        default_tz: Tz,
        send_meeting_invite: bool,
        send_meeting_reply: bool,
    ) -> Self {
        Self {
            analyzer,
            calendar,
            mail,
            my_email: my_email.into().to_lowercase(),
            default_tz,
            send_meeting_invite,
            send_meeting_reply,
        }
    }

    /// Process one message. Never panics or propagates: any internal
    /// failure becomes an `Error` outcome so one bad message cannot
    /// abort the batch.
    pub fn process(&self, msg: &ThreadMessage) -> Outcome {
        match self.process_inner(msg) {
            Ok(outcome) => outcome,
            Err(err) => Outcome::Error {
                msg_id: msg.id.clone(),
                reason: format!("process_message: {err}"),
            },
        }
    }

    fn process_inner(&self, msg: &ThreadMessage) -> Result<Outcome, BoxError> {
        let msg_id = msg.id.clone();
        let thread_id = msg.thread_id.clone();
        let subject = msg.header("Subject").unwrap_or("").to_string();
        let sender = msg.header("From").unwrap_or("").to_string();
        let to_field = msg.header("To").unwrap_or("").to_string();
        let cc_field = msg.header("Cc").unwrap_or("").to_string();
        info!(
            "processing id={} thread={} from={} subject={}",
            msg_id, thread_id, sender, subject
        );

        let body = msg.extract_text();
        if body.trim().is_empty() {
            warn!("message {} empty or only whitespace; skipping", msg_id);
            return Ok(Outcome::Skipped {
                msg_id,
                reason: "empty_body".to_string(),
            });
        }

        let subject_lower = subject.to_lowercase();
        if !CONFIRMATION_KEYWORDS
            .iter()
            .any(|keyword| subject_lower.contains(keyword))
        {
            info!("subject has no confirmation keyword; skipping {}", msg_id);
            return Ok(Outcome::Skipped {
                msg_id,
                reason: "no_confirmation_keyword".to_string(),
            });
        }

        let sent_at = self.baseline_instant(msg);
        let baseline_date = sent_at.format("%Y/%m/%d").to_string();

        let decision = self.analyzer.analyze(&body, &baseline_date);
        if let DecisionStatus::Error(reason) = &decision.status {
            return Ok(Outcome::Error {
                msg_id,
                reason: reason.clone(),
            });
        }

        if decision.clarify_needed || decision.meeting_intent != Some(true) {
            let recipients =
                self.clarify_recipients(&to_field, &cc_field, &sender, &decision.attendees);
            let all_to = recipients.join(", ");
            let reply_subject = format!(
                "Please clarify meeting time - {}",
                if subject.is_empty() {
                    "Meeting Confirmation"
                } else {
                    subject.as_str()
                }
            );
            let reason = if decision.clarify_reason.is_empty() {
                "We couldn't find a clear single meeting time in your message.".to_string()
            } else {
                decision.clarify_reason.clone()
            };
            let reply = compose_clarify_reply(&subject, &body, &reason);
            self.send_reply_best_effort(&thread_id, &all_to, &reply_subject, &reply, &msg_id);
            info!("clarification email sent; skipping follow-up processing");
            return Ok(Outcome::Clarify {
                msg_id,
                reason: if decision.clarify_reason.is_empty() {
                    "need_clarification".to_string()
                } else {
                    decision.clarify_reason.clone()
                },
            });
        }

        let free_time = decision.meeting_time.clone();
        let Some(start_local) = self.resolve_start(&free_time, sent_at) else {
            let reply_subject = if subject.is_empty() {
                "Please confirm the meeting time".to_string()
            } else {
                format!("Please confirm the meeting time - {subject}")
            };
            let hint = "Please reply with a confirmation in a format such as \
'2025-11-05 11:00' or 'next Tuesday at 5pm'. Thank you!";
            let reply =
                compose_clarify_reply(&subject, &body, &format!("invalid or unparsable time. {hint}"));
            let to_addr = clean_email_address(&sender).unwrap_or_else(|| sender.clone());
            self.send_reply_best_effort(&thread_id, &to_addr, &reply_subject, &reply, &msg_id);
            info!("clarification email (invalid time) sent");
            return Ok(Outcome::Clarify {
                msg_id,
                reason: "invalid_time".to_string(),
            });
        };

        let attendees = self.attendee_set(&to_field, &cc_field, &sender, &decision.attendees);
        let timezone = sender_timezone(msg.header("Date"), self.default_tz);
        let event_summary = if subject.is_empty() {
            "meeting".to_string()
        } else {
            subject.clone()
        };

        let request = EventRequest {
            thread_id: thread_id.clone(),
            summary: event_summary.clone(),
            start_local,
            timezone,
            attendees: attendees.clone(),
        };
        match self.calendar.create_event(&request) {
            Ok(CreateOutcome::Created {
                event_id,
                meet_link,
            }) => {
                if let Some(link) = meet_link.as_deref() {
                    if self.send_meeting_invite {
                        self.send_invite(&thread_id, &attendees, &event_summary, link, &free_time, &msg_id);
                    }
                    if self.send_meeting_reply {
                        self.send_created_reply(
                            &thread_id,
                            &attendees,
                            &event_summary,
                            link,
                            &free_time,
                            &msg_id,
                        );
                    }
                }
                info!("created event {} for message {}", event_id, msg_id);
                Ok(Outcome::Success {
                    msg_id,
                    event_id,
                    summary: event_summary,
                    meeting_time: free_time,
                    attendees,
                    meet_link,
                })
            }
            Ok(CreateOutcome::AlreadyExists { event_id }) => {
                info!(
                    "event {} already exists for message {}; idempotent success",
                    event_id, msg_id
                );
                Ok(Outcome::Success {
                    msg_id,
                    event_id,
                    summary: event_summary,
                    meeting_time: free_time,
                    attendees,
                    meet_link: None,
                })
            }
            Err(err) => {
                warn!("failed to create calendar event: {}", err);
                Ok(Outcome::Error {
                    msg_id,
                    reason: "create_event_failed".to_string(),
                })
            }
        }
    }

    fn baseline_instant(&self, msg: &ThreadMessage) -> DateTime<Tz> {
        msg.internal_date_millis()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .unwrap_or_else(Utc::now)
            .with_timezone(&self.default_tz)
    }

    /// Strict ISO forms first, then the human-time fallback anchored at
    /// the message's own timestamp.
    fn resolve_start(&self, free_time: &str, sent_at: DateTime<Tz>) -> Option<NaiveDateTime> {
        let free_time = free_time.trim();
        if free_time.is_empty() {
            return None;
        }
        for format in [
            "%Y-%m-%d %H:%M:%S",
            "%Y-%m-%d %H:%M",
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%dT%H:%M",
        ] {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(free_time, format) {
                return Some(parsed);
            }
        }
        parse_human_time(free_time, sent_at).map(|parsed| parsed.naive_local())
    }

    /// To/Cc + model-extracted attendees + sender, lowercased, minus the
    /// assistant itself; falls back to the sender when nothing remains.
    fn clarify_recipients(
        &self,
        to_field: &str,
        cc_field: &str,
        sender: &str,
        llm_attendees: &[String],
    ) -> Vec<String> {
        let mut recipients = BTreeSet::new();
        for field in [to_field, cc_field] {
            for part in field.split(',') {
                if let Some(addr) = clean_email_address(part) {
                    recipients.insert(addr.to_lowercase());
                }
            }
        }
        if let Some(addr) = clean_email_address(sender) {
            recipients.insert(addr.to_lowercase());
        }
        for raw in llm_attendees {
            if let Some(addr) = clean_email_address(raw) {
                recipients.insert(addr.to_lowercase());
            }
        }
        recipients.remove(&self.my_email);
        if recipients.is_empty() {
            if let Some(addr) = clean_email_address(sender) {
                recipients.insert(addr.to_lowercase());
            }
        }
        recipients.into_iter().collect()
    }

    fn attendee_set(
        &self,
        to_field: &str,
        cc_field: &str,
        sender: &str,
        llm_attendees: &[String],
    ) -> Vec<String> {
        let mut participants = BTreeSet::new();
        let add = |raw: &str, participants: &mut BTreeSet<String>| {
            if let Some(addr) = clean_email_address(raw) {
                let addr = addr.to_lowercase();
                if addr != self.my_email {
                    participants.insert(addr);
                }
            }
        };
        for field in [to_field, cc_field] {
            for part in field.split(',') {
                add(part, &mut participants);
            }
        }
        for raw in llm_attendees {
            add(raw, &mut participants);
        }
        add(sender, &mut participants);

        if participants.is_empty() {
            if let Some(addr) = clean_email_address(sender) {
                participants.insert(addr.to_lowercase());
            }
        }
        participants.into_iter().collect()
    }

    fn send_reply_best_effort(
        &self,
        thread_id: &str,
        to: &str,
        subject: &str,
        body: &str,
        msg_id: &str,
    ) {
        match self.mail.send_reply(Some(thread_id), to, subject, body, Some(msg_id)) {
            Ok(true) => {}
            Ok(false) => warn!("reply for {} dropped: no usable recipient", msg_id),
            Err(err) => warn!("failed to send reply for {}: {}", msg_id, err),
        }
    }

    fn send_invite(
        &self,
        thread_id: &str,
        attendees: &[String],
        summary: &str,
        meet_link: &str,
        start_time: &str,
        msg_id: &str,
    ) {
        let body = format!(
            "Hello,\n\nMeeting Time: {start_time}\nLink: {meet_link}\n\n\
Please arrive on time. If you need to make any modifications, please reply to this email.\n\n\
-- AI meeting assistant"
        );
        self.send_reply_best_effort(
            thread_id,
            &attendees.join(", "),
            &format!("Meeting Confirmation: {summary}"),
            &body,
            msg_id,
        );
    }

    fn send_created_reply(
        &self,
        thread_id: &str,
        attendees: &[String],
        summary: &str,
        meet_link: &str,
        start_time: &str,
        msg_id: &str,
    ) {
        let body = format!(
            "Meeting Created:\nSubject: {summary}\nTime: {start_time}\nMeet Link: {meet_link}"
        );
        self.send_reply_best_effort(
            thread_id,
            &attendees.join(", "),
            &format!("Meeting Created - {summary}"),
            &body,
            msg_id,
        );
    }
}

/// Clarification reply quoting the reason and a capped copy of the
/// original body.
pub fn compose_clarify_reply(subject: &str, email_body: &str, reason: &str) -> String {
    let safe_subject = squeeze_blank_lines(subject);
    let safe_body = truncate_quote(&squeeze_blank_lines(email_body));
    let reason = if reason.is_empty() { "unspecified" } else { reason };

    format!(
        "Dear Attendees,\n\n\
We received your meeting thread, but we could not determine a single confirmed meeting time.\n\
Reason from System Alert: {reason}\n\n\
Please see the original email content below:\n\
----------------------------------------\n\
Subject: {safe_subject}\n\n\
Body:\n\
{safe_body}\n\
----------------------------------------\n\
Thanks!\n\
- Automated conference assistant"
    )
}

fn squeeze_blank_lines(text: &str) -> String {
    let mut out = text.replace("\r\n", "\n").replace('\r', "\n");
    while out.contains("\n\n\n") {
        out = out.replace("\n\n\n", "\n\n");
    }
    out.trim().to_string()
}

fn truncate_quote(text: &str) -> String {
    if text.chars().count() <= BODY_QUOTE_LIMIT {
        return text.to_string();
    }
    let cut: String = text.chars().take(BODY_QUOTE_LIMIT).collect();
    format!("{cut}\n...[truncated]")
}
