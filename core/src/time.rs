/// Day bucketing for thread separators
use crate::messenger_types::ChatMessage;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

/// Messages of one calendar day
#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup<'a> {
    /// `YYYY-MM-DD` in the viewer's offset
    pub key: String,
    pub label: String,
    pub messages: Vec<&'a ChatMessage>,
}

pub fn local_date(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}

pub fn day_key(ts: DateTime<Utc>, offset: FixedOffset) -> String {
    local_date(ts, offset).format("%Y-%m-%d").to_string()
}

/// "Today", "Yesterday", or e.g. "Mon, Jan 5, 2026"
pub fn day_label(date: NaiveDate, today: NaiveDate) -> String {
    if date == today {
        "Today".to_string()
    } else if today.pred_opt() == Some(date) {
        "Yesterday".to_string()
    } else {
        date.format("%a, %b %-d, %Y").to_string()
    }
}

/// Split an ordered thread into consecutive day groups
pub fn group_by_day(
    messages: &[ChatMessage],
    offset: FixedOffset,
    today: NaiveDate,
) -> Vec<DayGroup<'_>> {
    let mut groups: Vec<DayGroup<'_>> = Vec::new();
    for msg in messages {
        let key = day_key(msg.created_at, offset);
        match groups.last_mut() {
            Some(group) if group.key == key => group.messages.push(msg),
            _ => groups.push(DayGroup {
                key,
                label: day_label(local_date(msg.created_at, offset), today),
                messages: vec![msg],
            }),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger_types::{DeliveryState, MessageKind};
    use chrono::TimeZone;

    fn msg_at(ts: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: Some(ts.timestamp().to_string()),
            local_key: None,
            conversation_id: "c".to_string(),
            sender_id: "u".to_string(),
            content: "x".to_string(),
            kind: MessageKind::Text,
            created_at: ts,
            state: DeliveryState::Sent,
            read: false,
            edited: false,
        }
    }

    #[test]
    fn test_group_by_day_respects_offset() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let plus3 = FixedOffset::east_opt(3 * 3600).unwrap();
        let messages = vec![
            msg_at(Utc.with_ymd_and_hms(2026, 3, 1, 20, 0, 0).unwrap()),
            msg_at(Utc.with_ymd_and_hms(2026, 3, 1, 22, 30, 0).unwrap()),
            msg_at(Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()),
        ];
        let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        let groups = group_by_day(&messages, utc, today);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].label, "Yesterday");
        assert_eq!(groups[0].messages.len(), 2);
        assert_eq!(groups[1].label, "Today");

        // 22:30 UTC is already March 2nd at +03:00
        let groups = group_by_day(&messages, plus3, today);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].messages.len(), 1);
        assert_eq!(groups[1].key, "2026-03-02");
        assert_eq!(groups[1].messages.len(), 2);
        assert_eq!(day_key(messages[1].created_at, utc), "2026-03-01");
    }

    #[test]
    fn test_day_label_older_dates() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        assert_eq!(day_label(date, today), "Mon, Jan 5, 2026");
    }
}
