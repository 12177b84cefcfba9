use std::io::{BufRead, BufReader};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use query_gate_config::HttpAgentSettings;
use query_gate_domain::ToolInvocation;
use serde_json::{json, Value};

use crate::{
    database_query_tool_definition, AgentBackend, AgentReply, AgentRequest, ChunkStream,
    ToolRuntime,
};

/// OpenAI-compatible chat-completions backend.
///
/// Round one offers the `database_query` tool and runs every returned call
/// through the [`ToolRuntime`]; round two asks for the final answer with
/// tools disabled.
#[derive(Debug, Clone)]
pub struct HttpJsonAgent {
    settings: HttpAgentSettings,
}

enum ToolRound {
    Answered(String),
    Continue { messages: Vec<Value>, tool_calls: usize },
}

impl HttpJsonAgent {
    #[must_use]
    pub fn new(settings: &HttpAgentSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    fn bearer_token(&self) -> Result<Option<String>> {
        match &self.settings.api_key_env {
            Some(env_name) => std::env::var(env_name).map(Some).map_err(|_| {
                anyhow!("missing env var '{env_name}' required by http_agent.api_key_env")
            }),
            None => Ok(None),
        }
    }

    fn post(&self, body: &Value) -> Result<ureq::Response> {
        let token = self.bearer_token()?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.settings.timeout_ms))
            .build();

        let mut req = agent
            .post(&self.settings.url)
            .set("content-type", "application/json");
        if let Some(token) = &token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        match req.send_json(body) {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                Err(anyhow!("http status {code}: {}", detail.trim()))
            }
            Err(ureq::Error::Transport(err)) => Err(anyhow!("http transport failure: {err}")),
        }
    }

    fn completion(&self, body: &Value) -> Result<Value> {
        self.post(body)?
            .into_json::<Value>()
            .context("failed to decode chat completion response")
    }

    fn tool_round(&self, runtime: &ToolRuntime<'_>, request: &AgentRequest) -> Result<ToolRound> {
        let mut messages = vec![
            json!({"role": "system", "content": request.instructions}),
            json!({"role": "user", "content": request.question}),
        ];

        let first = self.completion(&json!({
            "model": request.model,
            "messages": messages,
            "tools": [database_query_tool_definition()],
            "tool_choice": "auto",
        }))?;
        let message = first_choice_message(&first)?;

        let calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if calls.is_empty() {
            return Ok(ToolRound::Answered(message_content(message)));
        }

        messages.push(message.clone());
        for call in &calls {
            let call_id = call.get("id").and_then(Value::as_str).unwrap_or_default();
            let function = call.get("function").unwrap_or(&Value::Null);
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let arguments = function
                .get("arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}");

            let invocation = ToolInvocation::from_raw_arguments(name, call_id, arguments);
            let outcome = runtime.execute(&invocation)?;
            messages.push(json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": outcome.to_tool_content(self.settings.max_result_rows),
            }));
        }

        Ok(ToolRound::Continue {
            messages,
            tool_calls: calls.len(),
        })
    }

    fn final_round_body(request: &AgentRequest, messages: &[Value], stream: bool) -> Value {
        json!({
            "model": request.model,
            "messages": messages,
            "tools": [database_query_tool_definition()],
            "tool_choice": "none",
            "stream": stream,
        })
    }
}

impl AgentBackend for HttpJsonAgent {
    fn backend_name(&self) -> &'static str {
        "http_json"
    }

    fn respond(&self, runtime: &ToolRuntime<'_>, request: &AgentRequest) -> Result<AgentReply> {
        match self.tool_round(runtime, request)? {
            ToolRound::Answered(answer) => Ok(AgentReply {
                answer,
                tool_calls: 0,
            }),
            ToolRound::Continue {
                messages,
                tool_calls,
            } => {
                let second =
                    self.completion(&Self::final_round_body(request, &messages, false))?;
                Ok(AgentReply {
                    answer: message_content(first_choice_message(&second)?),
                    tool_calls,
                })
            }
        }
    }

    fn stream<'a>(
        &'a self,
        runtime: &ToolRuntime<'_>,
        request: &AgentRequest,
    ) -> Result<ChunkStream<'a>> {
        match self.tool_round(runtime, request)? {
            ToolRound::Answered(answer) => {
                Ok(Box::new(std::iter::once(Ok::<_, anyhow::Error>(answer))))
            }
            ToolRound::Continue { messages, .. } => {
                let response = self.post(&Self::final_round_body(request, &messages, true))?;
                Ok(Box::new(SseChunks::new(BufReader::new(
                    response.into_reader(),
                ))))
            }
        }
    }
}

fn first_choice_message(body: &Value) -> Result<&Value> {
    body.get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| anyhow!("chat completion response has no choices[0].message"))
}

fn message_content(message: &Value) -> String {
    message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Server-sent chat-completion deltas, one non-empty content fragment per pull.
pub struct SseChunks<R> {
    reader: R,
    line: String,
    finished: bool,
}

impl<R: BufRead> SseChunks<R> {
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            finished: false,
        }
    }

    fn fail(&mut self, err: anyhow::Error) -> Option<Result<String>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl<R: BufRead> Iterator for SseChunks<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.finished = true;
                }
                Ok(_) => {
                    let Some(payload) = self.line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        self.finished = true;
                        continue;
                    }
                    let event: Value = match serde_json::from_str(payload) {
                        Ok(event) => event,
                        Err(err) => {
                            return self.fail(anyhow!("malformed stream event: {err}"));
                        }
                    };
                    if let Some(message) = event.pointer("/error/message").and_then(Value::as_str)
                    {
                        let message = message.to_string();
                        return self.fail(anyhow!("upstream stream error: {message}"));
                    }
                    let delta = event
                        .pointer("/choices/0/delta/content")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if !delta.is_empty() {
                        return Some(Ok(delta.to_string()));
                    }
                }
                Err(err) => {
                    return self.fail(anyhow::Error::new(err).context("failed to read stream"));
                }
            }
        }
        None
    }
}
