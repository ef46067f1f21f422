//! System/automated-mail exclusion, applied by the coordinator before a
//! candidate reaches the processor. Heuristic and replaceable: the
//! coordinator takes this as a plain predicate, so a deployment can swap
//! in its own policy.

use gmail_module::message::ThreadMessage;

const NOTIFICATION_SENDERS: [&str; 3] = [
    "calendar-notification@google.com",
    "mailer-daemon",
    "postmaster@",
];

/// True when the message should never be analyzed: calendar/system
/// notifications, auto-submitted or bulk mail, self-addressed
/// notification subjects, or a body that opens with a script shebang.
pub fn is_system_or_notification(msg: &ThreadMessage, my_email: &str) -> bool {
    let from = msg.header("From").unwrap_or("").to_lowercase();
    let subject = msg.header("Subject").unwrap_or("").to_lowercase();
    let auto_submitted = msg.header("Auto-Submitted").unwrap_or("").to_lowercase();
    let precedence = msg.header("Precedence").unwrap_or("").to_lowercase();

    if NOTIFICATION_SENDERS
        .iter()
        .any(|marker| from.contains(marker))
    {
        return true;
    }

    if !auto_submitted.is_empty() && auto_submitted != "no" {
        return true;
    }
    if matches!(
        precedence.as_str(),
        "bulk" | "list" | "auto_reply" | "auto-reply"
    ) {
        return true;
    }

    let my_email = my_email.to_lowercase();
    if !my_email.is_empty()
        && from.contains(&my_email)
        && (subject.contains("notification") || subject.contains("confirmation"))
    {
        return true;
    }

    // pasted code rather than a meeting request
    let body = msg.extract_text();
    if let Some(first_line) = body.lines().find(|line| !line.trim().is_empty()) {
        if first_line.trim_start().starts_with("#!") {
            return true;
        }
    }

    false
}
