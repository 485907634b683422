//! Interactive question loop over a retrieval index.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::BoxFuture;

use super::engine::{Answer, RetrievalIndex};
use super::RetrievalError;

const PROMPT: &str = "User: ";
const EMPTY_QUERY_REPLY: &str = "Please enter a query";
const EXIT_WORDS: [&str; 2] = ["exit", "quit"];

/// Something that answers questions. Implemented by [`RetrievalIndex`].
pub trait QueryEngine: Send + Sync {
    fn answer<'a>(&'a self, question: &'a str) -> BoxFuture<'a, Result<Answer, RetrievalError>>;
}

impl QueryEngine for RetrievalIndex {
    fn answer<'a>(&'a self, question: &'a str) -> BoxFuture<'a, Result<Answer, RetrievalError>> {
        Box::pin(self.query(question))
    }
}

/// Reads questions line by line and writes answers until an exit word or EOF.
pub struct ChatSession<E> {
    engine: E,
}

impl<E: QueryEngine> ChatSession<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run the loop. Returns the number of questions answered.
    ///
    /// A failed question is reported to `writer` and the loop continues.
    pub async fn run<R, W>(&self, mut reader: R, mut writer: W) -> std::io::Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut answered = 0;
        let mut line = String::new();
        loop {
            writer.write_all(PROMPT.as_bytes()).await?;
            writer.flush().await?;

            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                writer.write_all(b"\n").await?;
                break;
            }
            let query = line.trim();
            if query.is_empty() {
                writer.write_all(format!("{EMPTY_QUERY_REPLY}\n").as_bytes()).await?;
                continue;
            }
            if EXIT_WORDS.iter().any(|w| query.eq_ignore_ascii_case(w)) {
                break;
            }

            match self.engine.answer(query).await {
                Ok(answer) => {
                    answered += 1;
                    writer.write_all(answer.render().as_bytes()).await?;
                    writer.write_all(b"\n\n").await?;
                }
                Err(err) => {
                    warn!(error = %err, "query failed");
                    writer.write_all(format!("Error: {err}\n").as_bytes()).await?;
                }
            }
        }
        writer.flush().await?;
        info!(answered, "chat session ended");
        Ok(answered)
    }
}
