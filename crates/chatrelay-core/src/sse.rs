use serde_json::Value;
use tracing::debug;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Incremental `data:` line decoder for an upstream SSE body.
///
/// Bytes may arrive split anywhere, including inside a line or inside a multi-byte UTF-8
/// sequence. Only complete lines are decoded; the unfinished tail is carried to the next
/// [`push`](Self::push). Lines that are not `data:` fields, empty payloads and the `[DONE]`
/// sentinel are dropped. A payload that is not valid JSON is logged and skipped.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    carry: String,
    pending: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.decode_into_carry(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.carry.find('\n') {
            let line = self.carry.drain(..=newline).collect::<String>();
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes the last line when the body ends without a trailing newline.
    pub fn finish(&mut self) -> Vec<Value> {
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.carry.push_str(&String::from_utf8_lossy(&tail));
        }
        let line = std::mem::take(&mut self.carry);
        decode_line(&line).into_iter().collect()
    }

    fn decode_into_carry(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let input = std::mem::take(&mut self.pending);
        let mut rest = input.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.carry.push_str(text);
                    return;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    self.carry.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(invalid) => {
                            self.carry.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[invalid..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn decode_line(line: &str) -> Option<Value> {
    let line = line.trim_end_matches(['\n', '\r']);
    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return None;
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(value) => Some(value),
        Err(error) => {
            debug!(
                event = "upstream.sse.malformed",
                error = %error,
                payload_len = payload.len(),
                "skipping undecodable upstream frame"
            );
            None
        }
    }
}
