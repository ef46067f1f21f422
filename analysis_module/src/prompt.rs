//! The instruction sent to the reasoning service.
//!
//! The decision policy embedded here is product behavior, not incidental
//! phrasing: confirmation rules, generic acceptance, counter-proposals and
//! the clarify conditions all live in this text. Change it deliberately.

/// Build the meeting-extraction instruction for one normalized thread.
///
/// `baseline_date` is `YYYY/MM/DD` and anchors every relative date in the
/// thread.
pub fn build_schedule_prompt(thread_text: &str, baseline_date: &str) -> String {
    format!(
        "Please analyze the following email THREAD and extract meeting details.\n\n\
THREAD (latest message first; quoted history may appear later):\n\
{thread_text}\n\n\
Work strictly from the participants' actual conversation. Ignore any AI/system analysis blocks and UI boilerplate.\n\
Use {{baseline_date}} = {baseline_date} as the reference for resolving relative dates.\n\n\
Time & date normalization (apply BEFORE validation):\n\
- Accept and normalize mixed formats: '20:00 PM' -> '20:00'; '8 pm' -> '20:00'; '2025\u{5e74}11\u{6708}4\u{65e5}' -> '2025/11/04'.\n\
- Normalize extra/misplaced spaces in dates like '2025 /11/7' -> '2025/11/07'.\n\
- Normalize separators to 'YYYY-MM-DD'.\n\
- If a short confirmation lacks a datetime (e.g., 'ok for me'), inherit the LAST explicitly proposed date+time above in the thread.\n\
- If only a date is proposed (no time), keep time unknown (do NOT invent a time).\n\
- If both 12h and 24h markers appear ('20:00 PM'), prefer 24h and drop AM/PM.\n\
- If AM/PM is missing in 12h times, infer only when unambiguous; otherwise leave unknown.\n\n\
Confirmation logic (thread-aware):\n\
CONFIRMED if and only if:\n\
1) Two or more different participants state the SAME specific date+time; or\n\
2) One participant proposes a specific date+time (or multiple options), and a different participant replies soon after with a clear acceptance WITHOUT contradicting that option.\n\
   Short acceptances (case-insensitive; English/Chinese examples): 'ok with me', 'works for me', 'the time is ok with me', 'sounds good', 'yes let's meet then', 'confirmed', \
'\u{53ef}\u{4ee5}', '\u{6ca1}\u{95ee}\u{9898}', '\u{53ef}\u{4ee5}\u{7684}', '\u{884c}', '\u{597d}', '\u{65f6}\u{95f4}\u{53ef}\u{4ee5}', '\u{5c31}\u{8fd9}\u{4e2a}\u{65f6}\u{95f4}', '\u{90a3}\u{5c31}\u{8fd9}\u{4e48}\u{5b9a}\u{4e86}'.\n\
In case (2), bind the acceptance to the LATEST unambiguous proposed datetime above. The accepter need not repeat the datetime.\n\n\
Generic acceptance (VERY IMPORTANT):\n\
- Treat phrases indicating acceptance of ANY/ALL options, despite grammar or typos, as generic acceptance of the offered choices. Examples include:\n\
  'both work', 'both works', 'both time(s) work', 'either works', 'either time is ok', 'any time works',\n\
  common typo variants like 'the time is both work for me', 'both are ok for me', 'ok to both', 'ok with both'.\n\
- When generic acceptance is present and the offer includes multiple specific candidate datetimes, SELECT the earliest FUTURE candidate relative to {{baseline_date}} and mark as CONFIRMED.\n\
- Do NOT require the accepter to restate the exact datetime if their intent is clearly 'both/either/any'.\n\n\
Counter-proposals & conflicts:\n\
- If a reply proposes a DIFFERENT datetime than the offered options (even same date but different time), treat it as a COUNTER-PROPOSAL.\n\
- A counter-proposal requires explicit acceptance by another participant to be confirmed.\n\
- If one message offers MULTIPLE candidate times and no later message accepts ANY of them (neither a single explicit pick nor a generic acceptance), treat as NOT CONFIRMED.\n\
- Do NOT auto-select a time unless there is explicit generic/specific acceptance as above.\n\n\
Cross-participant acceptance:\n\
- If participant A proposes a new specific datetime (counter-proposal), and a later message from participant B explicitly accepts the SAME datetime, treat this as CONFIRMED.\n\
- Example:\n\
  A: 'I'm not available then. My time is 2:00 PM 2025/11/7.'\n\
  B: 'The time is ok with me, 2:00 PM 2025/11/7.'\n\
  -> Confirmed at 2025-11-07 14:00 (clarify_needed=false).\n\n\
When to mark clarification needed:\n\
- Multiple times proposed with no acceptance (neither a specific pick nor a valid generic acceptance); or\n\
- Counter-proposal exists without acceptance; or\n\
- Time cannot be normalized to a valid clock time/date; or\n\
- All candidate times are in the past relative to {{baseline_date}}.\n\n\
Validation (AFTER normalization):\n\
- Valid time: 00:00-23:59; dates must exist (no Feb 30, etc.).\n\
- Prefer confirmed FUTURE datetimes. If multiple confirmed future datetimes exist (rare), return the earliest confirmed one.\n\n\
Attendees & subject:\n\
- Collect all visible email addresses (From/To/Cc or in-body).\n\
- Infer meeting subject from the thread subject if possible; otherwise empty.\n\n\
Output (return ONLY valid JSON with these fields):\n\
- meeting_intent: true/false\n\
- meeting_subject: string (empty if unknown)\n\
- meeting_time: 'YYYY-MM-DD HH:MM' in 24h (omit timezone)\n\
- attendees: list of emails\n\
- confidence: high/medium/low\n\
- clarify_needed: true/false\n\
- clarify_reason: string (empty if none)\n\
- reasoning: brief explanation referencing the acceptance or conflict logic used\n\n\
Examples:\n\
A) Confirmation by short acceptance:\n\
   Offer: 'the time is 20:00 PM 2025/11/4' -> normalize to '2025-11-04 20:00'.\n\
   Reply: 'the time is ok with me' -> confirmed; clarify_needed=false.\n\
B) Counter-proposal needing clarification:\n\
   Offer: '10:00 AM 2025/11/5' OR '3:00 PM 2025/11/6'.\n\
   Reply: 'I am ok to talk at 11:00 AM 2025/11/5.' (different from offered 10:00 on 11/5) -> COUNTER-PROPOSAL.\n\
   No later acceptance -> clarify_needed=true; meeting_time=''.\n\
C) Cross-participant confirmed:\n\
   A: 'My time is 2:00 PM 2025/11/7.'  B: 'The time is ok with me, 2:00 PM 2025/11/7.' -> Confirmed at 2025-11-07 14:00.\n\
D) Generic acceptance with multiple options (THIS IS IMPORTANT):\n\
   Offer: '11:00 AM 2025/11/7 or 3:00 PM 2025/11/7'.\n\
   Reply: 'The time is both work for me' (typo but clear generic acceptance) -> CONFIRMED at the earliest FUTURE option.\n\n\
All responses must be in English. Return ONLY the JSON."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_thread_and_baseline() {
        let prompt = build_schedule_prompt("A: meet 2025-11-07 14:00", "2025/11/05");
        assert!(prompt.contains("A: meet 2025-11-07 14:00"));
        assert!(prompt.contains("{baseline_date} = 2025/11/05"));
    }

    #[test]
    fn prompt_carries_the_decision_policy() {
        let prompt = build_schedule_prompt("x", "2025/11/05");
        assert!(prompt.contains("CONFIRMED if and only if"));
        assert!(prompt.contains("Generic acceptance"));
        assert!(prompt.contains("COUNTER-PROPOSAL"));
        assert!(prompt.contains("earliest FUTURE candidate"));
        assert!(prompt.contains("return ONLY valid JSON"));
    }

    #[test]
    fn prompt_requests_exact_output_fields() {
        let prompt = build_schedule_prompt("x", "2025/11/05");
        for field in [
            "meeting_intent",
            "meeting_subject",
            "meeting_time",
            "attendees",
            "confidence",
            "clarify_needed",
            "clarify_reason",
            "reasoning",
        ] {
            assert!(prompt.contains(field), "missing field {field}");
        }
    }
}
