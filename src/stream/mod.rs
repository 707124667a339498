//! Stream adapters: translate a provider's streaming wire format into the
//! normalized `StreamChunk` sequence (spec §4.1), hiding provider quirks
//! from the Agent Engine.

pub mod anthropic;
pub mod openai;

/// One decoded `event: <name>\ndata: <body>\n\n` SSE frame. `event` is
/// `None` for OpenAI-style streams, which only ever send `data:` lines.
#[derive(Debug, Clone)]
pub struct RawSseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Drains every complete (blank-line-terminated) SSE frame out of
/// `buffer`, leaving any trailing partial frame in place for the next
/// chunk of bytes. Shared by both stream adapters since the outer framing
/// (`data:`/`event:` lines, blank-line terminator) is identical; only the
/// JSON body shape differs between providers.
pub fn drain_sse_events(buffer: &mut String) -> Vec<RawSseEvent> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();
        let mut event_name = None;
        let mut data_lines = Vec::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event_name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start().to_string());
            }
        }
        if !data_lines.is_empty() {
            events.push(RawSseEvent {
                event: event_name,
                data: data_lines.join("\n"),
            });
        }
    }
    events
}

/// Strips control bytes the spec requires removed from any model-produced
/// token before it reaches the caller: 0x00-0x08, 0x0B, 0x0C, 0x0E-0x1F,
/// 0x7F. Tab, LF, CR are kept.
pub fn sanitize_token_text(input: &str) -> String {
    input
        .chars()
        .filter(|&c| {
            let b = c as u32;
            !((b <= 0x08)
                || b == 0x0B
                || b == 0x0C
                || (0x0E..=0x1F).contains(&b)
                || b == 0x7F)
        })
        .collect()
}
