//! 分块事件流的增量解析
//!
//! 字节先累积到缓冲区（按字节而非字符累积，UTF-8 多字节序列可以落在分块边界上），
//! 反复按空行（`\n\n` 或 `\r\n\r\n`）切出完整事件；末尾不完整的部分留到下一次 feed。

use serde::Deserialize;
use serde_json::Value;

use crate::stream::{LogEvent, StreamError, StreamEvent, SystemEvent};

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default)]
pub struct EventStreamParser {
    buffer: Vec<u8>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加字节并取出所有完整事件
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, StreamError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some((end, delimiter)) = find_delimiter(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + delimiter).take(end).collect();
            if let Some(event) = parse_frame(&frame)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// 流结束后解析残留的不完整事件
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, StreamError> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(parse_frame(&rest)?.into_iter().collect())
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

/// 最早出现的事件分隔符：（位置, 长度）
fn find_delimiter(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|pos| (pos, 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|pos| (pos, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// 合并 frame 中全部 `data:` 行；其他字段（event / id / 注释）忽略
fn data_payload(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn parse_frame(frame: &[u8]) -> Result<Option<StreamEvent>, StreamError> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| StreamError::Framing(format!("event is not valid UTF-8: {}", e)))?;
    let Some(payload) = data_payload(text) else {
        return Ok(None);
    };
    if payload.trim().is_empty() {
        return Ok(None);
    }

    let envelope: RawEnvelope = serde_json::from_str(&payload)?;
    let event = match envelope.kind.as_str() {
        "system" => StreamEvent::System(serde_json::from_value::<SystemEvent>(envelope.data)?),
        "log" => StreamEvent::Log(serde_json::from_value::<LogEvent>(envelope.data)?),
        _ => StreamEvent::Unknown {
            kind: envelope.kind,
            data: envelope.data,
        },
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{LogMessage, SystemStatus};

    const STREAM: &str = concat!(
        "data: {\"type\":\"log\",\"data\":{\"message\":\"正在点击登录按钮\"}}\n\n",
        ": keepalive\n\n",
        "data: {\"type\":\"log\",\"data\":{\"message\":{\"message\":\"dom settled\",\"level\":2}}}\r\n\r\n",
        "data: {\"type\":\"system\",\"data\":{\"status\":\"finished\",\"result\":{\"success\":true},\"cacheHit\":false}}\n\n",
    );

    fn parse_whole(bytes: &[u8]) -> Vec<StreamEvent> {
        let mut parser = EventStreamParser::new();
        let mut events = parser.feed(bytes).unwrap();
        events.extend(parser.finish().unwrap());
        events
    }

    #[test]
    fn test_parses_complete_stream() {
        let events = parse_whole(STREAM.as_bytes());
        assert_eq!(events.len(), 3);
        match &events[0] {
            StreamEvent::Log(LogEvent {
                message: LogMessage::Text(text),
            }) => assert_eq!(text, "正在点击登录按钮"),
            other => panic!("unexpected event: {:?}", other),
        }
        match &events[2] {
            StreamEvent::System(system) => {
                assert_eq!(system.status, SystemStatus::Finished);
                assert_eq!(system.cache_hit, Some(false));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let bytes = STREAM.as_bytes();
        let expected = parse_whole(bytes);
        for split in 0..=bytes.len() {
            let mut parser = EventStreamParser::new();
            let mut events = parser.feed(&bytes[..split]).unwrap();
            events.extend(parser.feed(&bytes[split..]).unwrap());
            events.extend(parser.finish().unwrap());
            assert_eq!(events, expected, "split at byte {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = STREAM.as_bytes();
        let mut parser = EventStreamParser::new();
        let mut events = Vec::new();
        for b in bytes {
            events.extend(parser.feed(std::slice::from_ref(b)).unwrap());
        }
        assert!(parser.is_empty_buffer());
        assert_eq!(events, parse_whole(bytes));
    }

    #[test]
    fn test_partial_event_is_retained() {
        let mut parser = EventStreamParser::new();
        let events = parser
            .feed(b"data: {\"type\":\"system\",\"data\":{\"status\":\"fin")
            .unwrap();
        assert!(events.is_empty());
        assert!(!parser.is_empty_buffer());
        let events = parser.feed(b"ished\"}}\n\n").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_multi_line_data_is_joined() {
        let events = parse_whole(b"data: {\"type\":\"log\",\ndata: \"data\":{\"message\":\"x\"}}\n\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        let mut parser = EventStreamParser::new();
        assert!(matches!(
            parser.feed(b"data: {oops}\n\n"),
            Err(StreamError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let events = parse_whole(b"data: {\"type\":\"metrics\",\"data\":{\"n\":1}}\n\n");
        assert!(matches!(&events[0], StreamEvent::Unknown { kind, .. } if kind == "metrics"));
    }
}
