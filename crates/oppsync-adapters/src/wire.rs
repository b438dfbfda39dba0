//! Upstream wire schema and its normalization into [`OpportunityRecord`].

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use oppsync_core::OpportunityRecord;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::warn;

/// Date format the search endpoint expects for `postedFrom` / `postedTo`.
pub const WIRE_DATE_FORMAT: &str = "%m/%d/%Y";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    #[serde(default)]
    pub opportunities_data: Option<Vec<JsonValue>>,
    #[serde(default)]
    pub total_records: u64,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub page_number: Option<u64>,
    #[serde(default)]
    pub total_pages: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOpportunity {
    notice_id: Option<String>,
    title: Option<String>,
    solicitation_number: Option<String>,
    full_parent_path_name: Option<String>,
    posted_date: Option<String>,
    #[serde(rename = "type")]
    notice_type: Option<String>,
    base_type: Option<String>,
    type_of_set_aside: Option<String>,
    type_of_set_aside_description: Option<String>,
    #[serde(rename = "responseDeadLine")]
    response_deadline: Option<String>,
    naics_code: Option<String>,
    classification_code: Option<String>,
    active: Option<JsonValue>,
    award: Option<RawAward>,
    description: Option<String>,
    ui_link: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAward {
    date: Option<String>,
    number: Option<String>,
    amount: Option<JsonValue>,
    awardee: Option<RawAwardee>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAwardee {
    name: Option<String>,
    #[serde(rename = "ueiSAM")]
    uei_sam: Option<String>,
    location: Option<RawLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLocation {
    city: Option<RawNamedCode>,
    state: Option<RawNamedCode>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNamedCode {
    code: Option<String>,
    name: Option<String>,
}

/// Accepts `YYYY-MM-DD`, `MM/dd/yyyy` or an RFC 3339 timestamp.
pub fn parse_calendar_date(input: &str) -> Option<NaiveDate> {
    let s = input.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(s, WIRE_DATE_FORMAT).ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

/// Reformats a calendar date for the wire. Unparsable input is returned
/// unchanged together with a warning instead of failing the call.
pub fn format_wire_date(input: &str) -> (String, Option<String>) {
    match parse_calendar_date(input) {
        Some(date) => (date.format(WIRE_DATE_FORMAT).to_string(), None),
        None => (
            input.to_string(),
            Some(format!("unparsable date `{input}` sent to upstream unchanged")),
        ),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_posted_date(value: &str) -> Option<NaiveDate> {
    parse_calendar_date(value).or_else(|| value.get(..10).and_then(parse_calendar_date))
}

fn parse_deadline(value: &str) -> Option<DateTime<Utc>> {
    let s = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    parse_calendar_date(s).and_then(|d| d.and_hms_opt(0, 0, 0)).map(|naive| naive.and_utc())
}

/// Award amounts arrive as JSON numbers or as strings (sometimes with `$`
/// and thousands separators).
pub fn parse_amount(value: &JsonValue) -> Option<Decimal> {
    let text = match value {
        JsonValue::String(s) => s.trim().trim_start_matches('$').replace(',', ""),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    Decimal::from_str(&text)
        .ok()
        .or_else(|| Decimal::from_scientific(&text).ok())
}

fn parse_active(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "y" => Some(true),
            "no" | "false" | "n" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn named_code(value: Option<RawNamedCode>) -> Option<String> {
    value.and_then(|v| non_empty(v.name).or_else(|| non_empty(v.code)))
}

/// Flattens one `opportunitiesData` element. Never drops the element: a shape
/// mismatch keeps whatever `noticeId` is present and leaves the rest empty.
pub fn normalize_opportunity(raw_payload: JsonValue) -> OpportunityRecord {
    let raw: RawOpportunity = match serde_json::from_value(raw_payload.clone()) {
        Ok(raw) => raw,
        Err(err) => {
            let notice_id = raw_payload
                .get("noticeId")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            warn!(notice_id = ?notice_id, error = %err, "upstream element did not match expected shape");
            RawOpportunity {
                notice_id,
                ..Default::default()
            }
        }
    };

    let segments = raw
        .full_parent_path_name
        .as_deref()
        .map(path_segments)
        .unwrap_or_default();
    let award = raw.award.unwrap_or_default();
    let awardee = award.awardee.unwrap_or_default();
    let location = awardee.location.unwrap_or_default();

    OpportunityRecord {
        opportunity_id: raw.notice_id.unwrap_or_default().trim().to_string(),
        title: non_empty(raw.title),
        description: non_empty(raw.description),
        solicitation_number: non_empty(raw.solicitation_number),
        notice_type: non_empty(raw.notice_type),
        base_type: non_empty(raw.base_type),
        naics_code: non_empty(raw.naics_code),
        classification_code: non_empty(raw.classification_code),
        department: segments.first().cloned(),
        sub_tier: segments.get(1).cloned(),
        office: if segments.len() >= 3 {
            segments.last().cloned()
        } else {
            None
        },
        full_parent_path: non_empty(raw.full_parent_path_name),
        posted_date: raw.posted_date.as_deref().and_then(parse_posted_date),
        response_deadline: raw.response_deadline.as_deref().and_then(parse_deadline),
        set_aside_code: non_empty(raw.type_of_set_aside),
        set_aside_description: non_empty(raw.type_of_set_aside_description),
        active: raw.active.as_ref().and_then(parse_active),
        award_amount: award.amount.as_ref().and_then(parse_amount),
        award_date: award.date.as_deref().and_then(parse_posted_date),
        award_number: non_empty(award.number),
        awardee_name: non_empty(awardee.name),
        awardee_uei: non_empty(awardee.uei_sam),
        awardee_city: named_code(location.city),
        awardee_state: location.state.and_then(|s| non_empty(s.code).or_else(|| non_empty(s.name))),
        ui_link: non_empty(raw.ui_link),
        raw_payload,
    }
}
