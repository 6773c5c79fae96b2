//! Prompt assembly and streaming chat completions.
//!
//! Retrieved chunks become a context block inside the final user message;
//! earlier turns are replayed as user/assistant pairs. Completions come
//! from any OpenAI-compatible `/chat/completions` endpoint with
//! `stream: true`, decoded from server-sent events.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{ChatConfig, Config};
use crate::embedding::{create_embedder, Embedder};
use crate::index::SearchHit;
use crate::search::retrieve;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Earlier `(question, answer)` turns as alternating messages.
pub fn history_to_messages(history: &[(String, String)]) -> Vec<ChatMessage> {
    history
        .iter()
        .flat_map(|(question, answer)| {
            [
                ChatMessage::user(question.as_str()),
                ChatMessage::assistant(answer.as_str()),
            ]
        })
        .collect()
}

/// One line per hit: text, external id, and an HTML link to the item.
pub fn format_context(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|hit| {
            format!(
                "{} {} -- <b><a href='{}'>LINK</a></b>\n",
                hit.text, hit.reference.external_id, hit.reference.url
            )
        })
        .collect()
}

/// The final user message. An empty context yields a plain question.
pub fn build_user_message(question: &str, context: &str) -> String {
    if context.is_empty() {
        return format!("Question : {}", question);
    }
    format!(
        "You are a helpful assistant. If the context provides sufficient information, \
         use it to answer the question (don't display links). \
         If the context has nothing to do with the subject, answer naturally.\n\
         ### Context :\n{}\n### Question :\n{}",
        context, question
    )
}

/// A running conversation. Each answered turn is replayed ahead of the
/// next question.
#[derive(Debug, Default)]
pub struct ChatSession {
    history: Vec<(String, String)>,
}

impl ChatSession {
    pub fn messages(&self, hits: &[SearchHit], question: &str) -> Vec<ChatMessage> {
        build_messages(&self.history, hits, question)
    }

    pub fn record(&mut self, question: &str, answer: String) {
        self.history.push((question.to_string(), answer));
    }

    pub fn turns(&self) -> usize {
        self.history.len()
    }
}

pub fn build_messages(
    history: &[(String, String)],
    hits: &[SearchHit],
    question: &str,
) -> Vec<ChatMessage> {
    let mut messages = history_to_messages(history);
    messages.push(ChatMessage::user(build_user_message(
        question,
        &format_context(hits),
    )));
    messages
}

/// Splits a server-sent event byte stream into `data:` payloads. Lines may
/// arrive split across network chunks, including inside a UTF-8 sequence,
/// so only complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(data) = line.trim_end_matches(['\r', '\n']).strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

/// Content delta carried by one streamed completion event, if any.
pub fn delta_content(payload: &str) -> Option<String> {
    let value: Value = serde_json::from_str(payload).ok()?;
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

pub struct ChatClient {
    http: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    api_key: Option<String>,
}

impl ChatClient {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .with_context(|| format!("{} environment variable not set", var))?,
            ),
            None => None,
        };

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            url: format!("{}/chat/completions", config.url.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key,
        })
    }

    /// Stream a completion, calling `on_token` for every content delta.
    /// Returns the full answer.
    pub async fn stream_completion<F>(
        &self,
        messages: &[ChatMessage],
        mut on_token: F,
    ) -> Result<String>
    where
        F: FnMut(&str),
    {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": true,
        });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Chat request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Chat completion failed: HTTP {}: {}", status, text);
        }

        let mut decoder = SseDecoder::default();
        let mut answer = String::new();
        let mut stream = response.bytes_stream();
        'events: while let Some(chunk) = stream.next().await {
            let bytes = chunk.context("Chat stream interrupted")?;
            for payload in decoder.push(&bytes) {
                if payload == "[DONE]" {
                    break 'events;
                }
                if let Some(token) = delta_content(&payload) {
                    on_token(&token);
                    answer.push_str(&token);
                }
            }
        }

        Ok(answer)
    }
}

/// `copilot ask`: answer a question, grounded in an index when one is given.
///
/// Without a question, reads questions from stdin one per line until EOF or
/// an empty line, replaying earlier turns as history.
pub async fn run_ask(
    config: &Config,
    db_id: Option<&str>,
    question: Option<&str>,
    k: Option<usize>,
) -> Result<()> {
    let embedder = match db_id {
        Some(_) => Some(create_embedder(&config.embedding)?),
        None => None,
    };
    let k = k.unwrap_or(config.retrieval.k);
    let client = ChatClient::new(&config.chat)?;
    let mut session = ChatSession::default();

    if let Some(question) = question {
        answer_turn(config, &client, &mut session, embedder.as_deref(), db_id, question, k)
            .await?;
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            break;
        }
        answer_turn(config, &client, &mut session, embedder.as_deref(), db_id, question, k)
            .await?;
    }
    tracing::info!(turns = session.turns(), "chat session ended");
    Ok(())
}

async fn answer_turn(
    config: &Config,
    client: &ChatClient,
    session: &mut ChatSession,
    embedder: Option<&dyn Embedder>,
    db_id: Option<&str>,
    question: &str,
    k: usize,
) -> Result<()> {
    let hits = match (embedder, db_id) {
        (Some(embedder), Some(db_id)) => retrieve(config, embedder, db_id, question, k).await?,
        _ => Vec::new(),
    };
    tracing::info!(hits = hits.len(), "retrieved context");

    let messages = session.messages(&hits, question);
    let mut stdout = std::io::stdout();
    let answer = client
        .stream_completion(&messages, |token| {
            let _ = stdout.write_all(token.as_bytes());
            let _ = stdout.flush();
        })
        .await?;
    println!();

    if !hits.is_empty() {
        println!();
        println!("References:");
        for hit in &hits {
            println!("  {}  {}", hit.reference.external_id, hit.reference.url);
        }
    }
    session.record(question, answer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reference;

    fn hit(text: &str, id: &str) -> SearchHit {
        SearchHit {
            text: text.to_string(),
            reference: Reference {
                external_id: id.to_string(),
                url: format!("https://polarion/#/project/TSS/workitem?id={id}"),
            },
            score: 0.8,
        }
    }

    #[test]
    fn context_lines_carry_links() {
        let context = format_context(&[hit("Stop the beam.", "SYS-1"), hit("Log.", "SYS-2")]);
        assert_eq!(
            context,
            "Stop the beam. SYS-1 -- <b><a href='https://polarion/#/project/TSS/workitem?id=SYS-1'>LINK</a></b>\n\
             Log. SYS-2 -- <b><a href='https://polarion/#/project/TSS/workitem?id=SYS-2'>LINK</a></b>\n"
        );
    }

    #[test]
    fn messages_with_and_without_context() {
        let history = vec![("Hi".to_string(), "Hello!".to_string())];

        let plain = build_messages(&history, &[], "What is TSS?");
        assert_eq!(plain.len(), 3);
        assert_eq!(plain[0], ChatMessage::user("Hi"));
        assert_eq!(plain[1], ChatMessage::assistant("Hello!"));
        assert_eq!(plain[2].content, "Question : What is TSS?");

        let grounded = build_messages(&[], &[hit("Stop the beam.", "SYS-1")], "When to stop?");
        assert_eq!(grounded.len(), 1);
        let content = &grounded[0].content;
        assert!(content.contains("### Context :\nStop the beam. SYS-1"));
        assert!(content.ends_with("### Question :\nWhen to stop?"));
    }

    #[test]
    fn sse_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"choices\":[{\"delta\":").is_empty());
        let payloads = decoder.push(b"{\"content\":\"Hel\"}}]}\n\ndata: [DONE]\n");
        assert_eq!(payloads.len(), 2);
        assert_eq!(delta_content(&payloads[0]).as_deref(), Some("Hel"));
        assert_eq!(payloads[1], "[DONE]");
    }

    #[test]
    fn sse_multibyte_char_split_across_chunks() {
        let payload = "data: {\"choices\":[{\"delta\":{\"content\":\"é\"}}]}\n".as_bytes();
        let split = payload.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&payload[..split]).is_empty());
        let payloads = decoder.push(&payload[split..]);
        assert_eq!(payloads.len(), 1);
        assert_eq!(delta_content(&payloads[0]).as_deref(), Some("é"));
    }

    #[test]
    fn session_replays_answered_turns() {
        let mut session = ChatSession::default();
        let first = session.messages(&[], "What is TSS?");
        assert_eq!(first.len(), 1);

        session.record("What is TSS?", "The treatment safety system.".to_string());
        let second = session.messages(&[hit("Stop the beam.", "SYS-1")], "When does it act?");
        assert_eq!(session.turns(), 1);
        assert_eq!(second.len(), 3);
        assert_eq!(second[0], ChatMessage::user("What is TSS?"));
        assert_eq!(second[1], ChatMessage::assistant("The treatment safety system."));
        assert!(second[2].content.contains("### Context :\nStop the beam. SYS-1"));
    }

    #[test]
    fn role_only_delta_has_no_content() {
        assert_eq!(
            delta_content(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            None
        );
        assert_eq!(delta_content("not json"), None);
    }
}
