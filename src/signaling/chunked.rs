//! Chunked-JSON reassembly (spec.md §4.8, §8 scenario 2).
//!
//! Grounded on `examples/original_source/src/app_ws_client.cc`'s
//! `AppWsClient::OnMessage`: some browsers fragment a JSON document across
//! multiple WebSocket text frames, so a per-connection accumulator retries
//! parsing the concatenation up to `kMaxChunkedFrames` times before giving up.

use serde_json::Value;

/// `kMaxChunkedFrames` in the original: after this many failed reassembly
/// attempts the buffer is dropped (spec.md §4.8 step 5, §7 `ChunkOverflow`).
pub const MAX_CHUNKED_FRAMES: u32 = 5;

#[derive(Debug)]
pub enum ChunkOutcome {
    /// A complete JSON object with a `cmd` field was parsed; dispatch it.
    Dispatch(Value),
    /// Still waiting for more chunks; the caller does nothing further.
    Buffering,
    /// The retry ceiling was exceeded; the buffer was cleared and the
    /// fragment sequence dropped (spec.md §7 `ChunkOverflow`).
    Overflowed,
}

/// Per-socket accumulator plus retry counter (spec.md §3 "Chunked-Frame
/// Buffer"). Either empty (ready for a fresh parse) or holds a prefix of a
/// JSON document whose next chunk will complete it.
#[derive(Debug, Default)]
pub struct ChunkedFrameBuffer {
    accumulator: String,
    retries: u32,
}

impl ChunkedFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulator.is_empty()
    }

    fn clear(&mut self) {
        self.accumulator.clear();
        self.retries = 0;
    }

    /// Runs the reassembly algorithm in spec.md §4.8 over one incoming
    /// WebSocket payload.
    pub fn feed(&mut self, payload: &str) -> ChunkOutcome {
        // 1-2. Attempt to parse the incoming payload standalone first; if it
        // parses and carries a `cmd` field, dispatch without touching the
        // accumulator at all (the common, unfragmented case).
        if self.accumulator.is_empty() {
            if let Ok(value) = serde_json::from_str::<Value>(payload) {
                if has_cmd(&value) {
                    return ChunkOutcome::Dispatch(value);
                }
            }
        }

        // 3. Append to the per-connection chunk buffer.
        self.accumulator.push_str(payload);

        // 4. Attempt to parse the buffer.
        match serde_json::from_str::<Value>(&self.accumulator) {
            Ok(value) if has_cmd(&value) => {
                self.clear();
                ChunkOutcome::Dispatch(value)
            }
            Ok(_) | Err(_) => {
                self.retries += 1;
                if self.retries > MAX_CHUNKED_FRAMES {
                    self.clear();
                    ChunkOutcome::Overflowed
                } else {
                    ChunkOutcome::Buffering
                }
            }
        }
    }
}

fn has_cmd(value: &Value) -> bool {
    value.get("cmd").and_then(Value::as_str).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfragmented_message_dispatches_immediately() {
        let mut buf = ChunkedFrameBuffer::new();
        let outcome = buf.feed(r#"{"cmd":"request","type":"deviceid"}"#);
        assert!(matches!(outcome, ChunkOutcome::Dispatch(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn two_chunk_register_dispatches_exactly_once_scenario_2() {
        // spec.md §8 scenario 2: `{"cmd":"regi` then `ster","roomid":1,"clientid":2}`.
        let mut buf = ChunkedFrameBuffer::new();
        let first = buf.feed(r#"{"cmd":"regi"#);
        assert!(matches!(first, ChunkOutcome::Buffering));
        assert!(!buf.is_empty());

        let second = buf.feed(r#"ster","roomid":1,"clientid":2}"#);
        match second {
            ChunkOutcome::Dispatch(value) => {
                assert_eq!(value["cmd"], "register");
                assert_eq!(value["roomid"], 1);
                assert_eq!(value["clientid"], 2);
            }
            other => panic!("expected Dispatch, got {other:?}"),
        }
        assert!(buf.is_empty(), "chunk buffer must be empty after dispatch");
    }

    #[test]
    fn overflow_after_five_failed_attempts_drops_buffer() {
        let mut buf = ChunkedFrameBuffer::new();
        for _ in 0..MAX_CHUNKED_FRAMES {
            let outcome = buf.feed("{\"cmd\":\"x");
            assert!(matches!(outcome, ChunkOutcome::Buffering));
        }
        let overflow = buf.feed("\"still not json");
        assert!(matches!(overflow, ChunkOutcome::Overflowed));
        assert!(buf.is_empty());
    }

    #[test]
    fn valid_json_without_cmd_field_is_buffered_not_dispatched() {
        let mut buf = ChunkedFrameBuffer::new();
        let outcome = buf.feed(r#"{"roomid":1}"#);
        assert!(matches!(outcome, ChunkOutcome::Buffering));
    }
}
