use chatrelay_contracts::ChatCompletionChunk;

/// One outbound SSE frame: a serialized chunk or the literal `[DONE]` terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Chunk(ChatCompletionChunk),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    Init,
    Streaming,
    Done,
}

/// Keeps the outbound chunk sequence well formed: one role-only chunk first, content chunks
/// after it, and exactly one stop chunk plus `[DONE]` at the end. Once `Done`, every call is a
/// no-op, so late upstream bytes racing with completion cannot write past the close.
#[derive(Debug, Clone)]
pub struct ChunkEmitter {
    id: String,
    created: i64,
    model: String,
    state: EmitterState,
}

impl ChunkEmitter {
    pub fn new(id: impl Into<String>, created: i64, model: impl Into<String>) -> Self {
        Self { id: id.into(), created, model: model.into(), state: EmitterState::Init }
    }

    pub fn state(&self) -> EmitterState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == EmitterState::Done
    }

    pub fn open(&mut self) -> Vec<SseFrame> {
        if self.state != EmitterState::Init {
            return Vec::new();
        }
        self.state = EmitterState::Streaming;
        vec![SseFrame::Chunk(ChatCompletionChunk::role(&self.id, self.created, &self.model))]
    }

    pub fn content(&mut self, text: &str) -> Vec<SseFrame> {
        if self.is_closed() || text.is_empty() {
            return Vec::new();
        }
        let mut frames = self.open();
        frames.push(SseFrame::Chunk(ChatCompletionChunk::content(
            &self.id,
            self.created,
            &self.model,
            text,
        )));
        frames
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.is_closed() {
            return Vec::new();
        }
        let mut frames = self.open();
        self.state = EmitterState::Done;
        let stop = ChatCompletionChunk::stop(&self.id, self.created, &self.model);
        frames.push(SseFrame::Chunk(stop));
        frames.push(SseFrame::Done);
        frames
    }
}
