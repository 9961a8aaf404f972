use minijinja::{context, Environment, Error, ErrorKind};
use serde_json::Value;

use crate::error::{ModelError, Result};

/// Inputs to a chat template render.
pub(crate) struct ChatRequest<'a> {
    pub template: &'a str,
    pub messages: &'a str,
    pub tools: Option<&'a str>,
    pub add_generation_prompt: bool,
    pub bos_token: &'a str,
    pub eos_token: &'a str,
}

fn raise_exception(message: String) -> std::result::Result<String, Error> {
    Err(Error::new(ErrorKind::InvalidOperation, message))
}

fn parse(json: &str, what: &str) -> Result<Value> {
    serde_json::from_str(json)
        .map_err(|e| ModelError::InvalidArgument(format!("{} is not valid JSON: {}", what, e)))
}

pub(crate) fn render(request: &ChatRequest<'_>) -> Result<String> {
    let messages = parse(request.messages, "messages")?;
    if !messages.is_array() {
        return Err(ModelError::InvalidArgument(
            "messages must be a JSON array".to_string(),
        ));
    }
    let tools = match request.tools {
        Some(t) if !t.trim().is_empty() => parse(t, "tools")?,
        _ => Value::Null,
    };

    let mut env = Environment::new();
    env.add_function("raise_exception", raise_exception);
    env.add_template("chat", request.template)?;
    let template = env.get_template("chat")?;
    let rendered = template.render(context! {
        messages => messages,
        tools => tools,
        add_generation_prompt => request.add_generation_prompt,
        bos_token => request.bos_token,
        eos_token => request.eos_token,
    })?;
    Ok(rendered)
}
