/// Accumulated partial text for one speaker.
///
/// Handed out with [`TranscriptBuffer::take`], which also resets it, so
/// finalized text never leaks into the next utterance.
#[derive(Debug, Default, Clone)]
pub struct TranscriptBuffer {
    text: String,
}

impl TranscriptBuffer {
    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
    }

    pub fn peek(&self) -> &str {
        &self.text
    }

    /// The accumulated text, if any, leaving the buffer empty.
    pub fn take(&mut self) -> Option<String> {
        if self.text.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.text))
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}
