//! Minimal Server-Sent-Events parsing for the beacon node event stream.
//!
//! The parser is fed raw response chunks and yields complete events. An
//! unknown event name is a hard error: it implies a protocol version
//! mismatch with the beacon node and must not be silently dropped.

use thiserror::Error;

use vigil_shared::beacon_api::{
    AttesterSlashingEvent, BeaconNodeEvent, ChainReorgEvent, HeadEvent, ProposerSlashingEvent,
};

#[derive(Debug, Error)]
pub enum SseError {
    #[error("unable to process event with name {name}, event data: {data:?}")]
    UnknownEvent { name: String, data: Vec<String> },
    #[error("event {name} carried no data lines")]
    MissingData { name: String },
    #[error("failed to decode {name} event: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("event stream is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSseEvent {
    pub name: String,
    pub data: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current_event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        SseParser::default()
    }

    /// Feed a chunk of the response body, returning any events completed by
    /// it. Incomplete trailing lines stay buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<RawSseEvent>, SseError> {
        let text = std::str::from_utf8(chunk).map_err(|_| SseError::InvalidUtf8)?;
        self.buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(event) = self.process_line(line.trim_end_matches(['\r', '\n'])) {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str) -> Option<RawSseEvent> {
        if line.starts_with(':') {
            tracing::debug!("SSE comment {line}");
            return None;
        }

        if line.is_empty() {
            // Events are separated by empty lines; a lone empty line is a
            // keep-alive.
            let name = self.current_event.take()?;
            let data = std::mem::take(&mut self.data_lines);
            return Some(RawSseEvent { name, data });
        }

        if let Some(rest) = line.strip_prefix("event:") {
            self.current_event = Some(rest.trim().to_string());
            return None;
        }

        if let Some(rest) = line.strip_prefix("data:") {
            if self.current_event.is_some() {
                self.data_lines.push(rest.trim().to_string());
            } else {
                tracing::warn!("SSE data line outside of an event: {line:?}");
            }
            return None;
        }

        tracing::warn!("Unexpected message in beacon node event stream: {line:?}");
        None
    }
}

/// Decode a raw event into its typed representation.
pub fn decode_event(raw: &RawSseEvent) -> Result<BeaconNodeEvent, SseError> {
    let data = raw.data.first().ok_or_else(|| SseError::MissingData {
        name: raw.name.clone(),
    })?;

    let decode_err = |source| SseError::Decode {
        name: raw.name.clone(),
        source,
    };

    match raw.name.as_str() {
        "head" => serde_json::from_str::<HeadEvent>(data)
            .map(BeaconNodeEvent::Head)
            .map_err(decode_err),
        "chain_reorg" => serde_json::from_str::<ChainReorgEvent>(data)
            .map(BeaconNodeEvent::ChainReorg)
            .map_err(decode_err),
        "attester_slashing" => serde_json::from_str::<AttesterSlashingEvent>(data)
            .map(BeaconNodeEvent::AttesterSlashing)
            .map_err(decode_err),
        "proposer_slashing" => serde_json::from_str::<ProposerSlashingEvent>(data)
            .map(BeaconNodeEvent::ProposerSlashing)
            .map_err(decode_err),
        _ => Err(SseError::UnknownEvent {
            name: raw.name.clone(),
            data: raw.data.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_event_json() -> &'static str {
        r#"{"slot":"101","block":"0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa","previous_duty_dependent_root":"0x01","current_duty_dependent_root":"0x02","execution_optimistic":false}"#
    }

    #[test]
    fn parses_a_complete_event() {
        let mut parser = SseParser::new();
        let chunk = format!("event: head\ndata: {}\n\n", head_event_json());
        let events = parser.push(chunk.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "head");

        let event = decode_event(&events[0]).unwrap();
        match event {
            BeaconNodeEvent::Head(head) => assert_eq!(head.slot, 101),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn handles_chunks_split_mid_line() {
        let mut parser = SseParser::new();
        let full = format!("event: head\ndata: {}\n\n", head_event_json());
        let (first, second) = full.split_at(20);
        assert!(parser.push(first.as_bytes()).unwrap().is_empty());
        let events = parser.push(second.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn ignores_comments_and_keep_alives() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive comment\n\n\n").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn unknown_event_name_is_fatal() {
        let raw = RawSseEvent {
            name: "finalized_checkpoint".into(),
            data: vec!["{}".into()],
        };
        assert!(matches!(
            decode_event(&raw),
            Err(SseError::UnknownEvent { .. })
        ));
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let chunk = format!(
            "event: head\ndata: {json}\n\nevent: chain_reorg\ndata: {reorg}\n\n",
            json = head_event_json(),
            reorg = r#"{"slot":"102","depth":"2","old_head_block":"0xaa","new_head_block":"0xbb","execution_optimistic":false}"#
        );
        let events = parser.push(chunk.as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].name, "chain_reorg");
        let reorg = decode_event(&events[1]).unwrap();
        assert_eq!(reorg.slot(), Some(102));
    }

    proptest::proptest! {
        // Chunk boundaries are arbitrary; splitting a stream anywhere must
        // not change the parsed events.
        #[test]
        fn parsing_is_split_invariant(split in 0usize..60) {
            let full = format!("event: head\ndata: {}\n\n", head_event_json());
            let split = split.min(full.len());
            let mut parser = SseParser::new();
            let mut events = parser.push(full[..split].as_bytes()).unwrap();
            events.extend(parser.push(full[split..].as_bytes()).unwrap());
            proptest::prop_assert_eq!(events.len(), 1);
            proptest::prop_assert_eq!(events[0].name.as_str(), "head");
        }
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let mut parser = SseParser::new();
        let chunk = format!("event: head\r\ndata: {}\r\n\r\n", head_event_json());
        let events = parser.push(chunk.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
    }
}
