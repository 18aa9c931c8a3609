//! JSON-RPC client for the master's command surface, shared by the
//! query commands.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use crate::config::Config;

/// Resolve the surface address from `--url` or the configuration.
pub fn surface_url(url: Option<&str>, config_path: Option<&PathBuf>) -> Result<String> {
    if let Some(url) = url {
        return Ok(url.to_string());
    }
    let config = Config::load(config_path.map(|p| p.as_path()))?;
    Ok(format!("http://{}/rpc", config.surface.bind))
}

/// One JSON-RPC 2.0 call against a running master.
pub async fn call(url: &str, method: &str, params: Value) -> Result<Value> {
    let payload = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    let response = reqwest::Client::new()
        .post(url)
        .json(&payload)
        .send()
        .await
        .with_context(|| format!("cannot reach master at {url}; is `docwatch serve` running?"))?;

    let reply: Value = response
        .json()
        .await
        .context("undecodable reply from master")?;

    if let Some(error) = reply.get("error") {
        bail!(
            "master refused {method}: {}",
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
        );
    }

    Ok(reply.get("result").cloned().unwrap_or(Value::Null))
}
