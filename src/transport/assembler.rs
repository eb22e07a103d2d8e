/// Joins streamed reply fragments into complete replies.
///
/// Fragments are concatenated strictly in the order pushed; a reply is only
/// released when a final fragment arrives.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    buffer: String,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Returns the whole reply when `is_final` is set.
    pub fn push(&mut self, text: &str, is_final: bool) -> Option<String> {
        self.buffer.push_str(text);
        if !is_final {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }
}
