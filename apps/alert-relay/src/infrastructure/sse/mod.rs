//! Event Stream Codec
//!
//! Text framing shared by the relay's stream endpoints and the outbound
//! stream client.
//!
//! # Format
//!
//! Each event is one or more `data:` lines followed by a blank line. The
//! payload is either a JSON alert or the literal `keep-alive`:
//!
//! ```text
//! data: {"id":"133","cat":"1","type":"missiles",...}
//!
//! data: keep-alive
//!
//! ```
//!
//! Comment lines (starting with `:`) and other fields are ignored by the
//! decoder; consumers still count them as liveness.

use crate::domain::alert::Alert;

/// Keep-alive payload.
pub const KEEP_ALIVE: &str = "keep-alive";

/// A decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// An alert payload.
    Alert(Box<Alert>),
    /// A keep-alive marker.
    KeepAlive,
    /// A payload that is neither an alert nor a keep-alive.
    Unrecognized(String),
}

/// Classify a complete event payload.
#[must_use]
pub fn decode_payload(payload: &str) -> StreamFrame {
    let payload = payload.trim();
    if payload == KEEP_ALIVE {
        return StreamFrame::KeepAlive;
    }
    serde_json::from_str::<Alert>(payload).map_or_else(
        |_| StreamFrame::Unrecognized(payload.to_string()),
        |alert| StreamFrame::Alert(Box::new(alert)),
    )
}

/// Incremental line decoder.
#[derive(Debug, Default)]
pub struct EventDecoder {
    data: Vec<String>,
}

impl EventDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Feed one line (without terminator). Returns a frame when the line
    /// completes an event.
    pub fn push_line(&mut self, line: &str) -> Option<StreamFrame> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let payload = self.data.join("\n");
            self.data.clear();
            return Some(decode_payload(&payload));
        }

        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn decode_all(text: &str) -> Vec<StreamFrame> {
        let mut decoder = EventDecoder::new();
        text.split('\n')
            .filter_map(|line| decoder.push_line(line))
            .collect()
    }

    #[test]
    fn alert_event_decodes() {
        let alert = Alert::new("1", 1, vec!["Ashkelon".to_string()], "Rockets", Utc::now());
        let json = serde_json::to_string(&alert).unwrap();
        let frames = decode_all(&format!("data: {json}\n\n"));
        assert_eq!(frames, vec![StreamFrame::Alert(Box::new(alert))]);
    }

    #[test]
    fn keep_alive_decodes() {
        assert_eq!(
            decode_all(&format!("data: {KEEP_ALIVE}\n\n")),
            vec![StreamFrame::KeepAlive]
        );
    }

    #[test]
    fn comments_and_other_fields_are_ignored() {
        let frames = decode_all(": ping\n\nevent: new_alert\ndata: keep-alive\n\n");
        assert_eq!(frames, vec![StreamFrame::KeepAlive]);
    }

    #[test]
    fn crlf_lines_are_accepted() {
        let frames = decode_all("data: keep-alive\r\n\r\n");
        assert_eq!(frames, vec![StreamFrame::KeepAlive]);
    }

    #[test]
    fn multi_line_data_is_joined() {
        let frames = decode_all("data: {\"id\":\"9\",\ndata: \"cat\":\"1\",\"cities\":[\"Haifa\"]}\n\n");
        match &frames[..] {
            [StreamFrame::Alert(alert)] => {
                assert_eq!(alert.id, "9");
                assert_eq!(alert.areas, vec!["Haifa"]);
            }
            other => panic!("unexpected frames {other:?}"),
        }
    }

    #[test]
    fn garbage_is_unrecognized() {
        assert_eq!(
            decode_payload("hello"),
            StreamFrame::Unrecognized("hello".to_string())
        );
    }

    #[test]
    fn upstream_style_payload_decodes() {
        let frame = decode_payload(r#"{"id":"5","cat":"1","title":"t","data":["Sderot"]}"#);
        match frame {
            StreamFrame::Alert(alert) => assert_eq!(alert.areas, vec!["Sderot"]),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
