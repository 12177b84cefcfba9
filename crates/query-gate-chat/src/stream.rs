use std::mem;

use anyhow::Result;
use query_gate_agent::ChunkStream;
use query_gate_db::LoggedConnection;
use query_gate_domain::ThreadId;

use crate::{ChatService, TurnState};

enum Phase<'a> {
    Pending,
    Streaming {
        conn: LoggedConnection,
        chunks: ChunkStream<'a>,
        content: String,
    },
    Done,
}

/// Pull-driven answer stream for one chat turn.
///
/// The first pull persists the user message and invokes the agent. When the
/// agent's chunks run out the concatenated answer is stored as one assistant
/// message. An error is yielded once and ends the stream; nothing further is
/// persisted for that turn.
pub struct ChatStream<'s, 'a> {
    service: &'s ChatService<'a>,
    thread_id: ThreadId,
    question: String,
    phase: Phase<'a>,
}

impl<'s, 'a> ChatStream<'s, 'a> {
    pub(crate) fn new(service: &'s ChatService<'a>, thread_id: ThreadId, question: &str) -> Self {
        Self {
            service,
            thread_id,
            question: question.to_string(),
            phase: Phase::Pending,
        }
    }

    fn start(&self) -> Result<(LoggedConnection, ChunkStream<'a>)> {
        let conn = self.service.begin_turn(self.thread_id, &self.question)?;
        self.service.enter(TurnState::AgentInvoked);
        let chunks = self.service.open_stream(&conn, &self.question)?;
        Ok((conn, chunks))
    }

    fn fail(&mut self, err: anyhow::Error) -> Option<Result<String>> {
        self.phase = Phase::Done;
        self.service.stream_failed(self.thread_id, &self.question, &err);
        Some(Err(err))
    }
}

impl Iterator for ChatStream<'_, '_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.phase {
                Phase::Pending => match self.start() {
                    Ok((conn, chunks)) => {
                        self.phase = Phase::Streaming {
                            conn,
                            chunks,
                            content: String::new(),
                        };
                    }
                    Err(err) => return self.fail(err),
                },
                Phase::Streaming { chunks, content, .. } => match chunks.next() {
                    Some(Ok(chunk)) => {
                        content.push_str(&chunk);
                        return Some(Ok(chunk));
                    }
                    Some(Err(err)) => return self.fail(err),
                    None => {
                        let Phase::Streaming { conn, content, .. } =
                            mem::replace(&mut self.phase, Phase::Done)
                        else {
                            return None;
                        };
                        return match self.service.finish_stream(self.thread_id, &conn, content) {
                            Ok(_) => None,
                            Err(err) => self.fail(err),
                        };
                    }
                },
                Phase::Done => return None,
            }
        }
    }
}
