//! Namespaced tool catalogue: maps `mcp.<server>.<tool>` to the owning client
//! and the server's original tool name.
//!
//! The registry is read-many/write-rare: the chat loop resolves on every tool
//! call, while registration only happens at bootstrap and on server
//! add/remove. Namespaced names are globally unique; collisions are rejected
//! before anything is inserted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::{json, Value};

use crate::mcp::McpClient;

/// Prefix of every registered tool name.
pub const NAMESPACE_PREFIX: &str = "mcp";

pub fn namespaced_name(server: &str, tool: &str) -> String {
    format!("{NAMESPACE_PREFIX}.{server}.{tool}")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("tool name collision: {0}")]
    Collision(String),
    #[error("unknown tool: {0}")]
    Unknown(String),
}

/// One registered tool; `input_schema` is the server's JSON Schema, if any.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredTool {
    pub namespaced_name: String,
    pub server_name: String,
    pub original_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

struct Entry {
    tool: RegisteredTool,
    client: Arc<McpClient>,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Entry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every tool the client currently advertises under
    /// `mcp.<server>.<tool>`. Nothing is inserted when any name collides.
    pub fn add_client(&self, client: &Arc<McpClient>) -> Result<usize, RegistryError> {
        let server = client.name().to_string();
        let definitions = client.cached_tools();
        let mut map = self.tools.write().unwrap_or_else(|e| e.into_inner());
        for def in &definitions {
            let name = namespaced_name(&server, &def.name);
            if map.contains_key(&name) {
                return Err(RegistryError::Collision(name));
            }
        }
        let count = definitions.len();
        for def in definitions {
            let name = namespaced_name(&server, &def.name);
            map.insert(
                name.clone(),
                Entry {
                    tool: RegisteredTool {
                        namespaced_name: name,
                        server_name: server.clone(),
                        original_name: def.name,
                        description: def.description,
                        input_schema: def.input_schema,
                    },
                    client: Arc::clone(client),
                },
            );
        }
        Ok(count)
    }

    /// Drops every tool that belongs to `server`. Returns how many were removed.
    pub fn remove_client(&self, server: &str) -> usize {
        let mut map = self.tools.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, entry| entry.tool.server_name != server);
        before - map.len()
    }

    pub fn get_tool(&self, namespaced: &str) -> Option<RegisteredTool> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(namespaced)
            .map(|e| e.tool.clone())
    }

    /// Resolves a namespaced name to the owning client and original tool name.
    pub fn resolve(&self, namespaced: &str) -> Result<(Arc<McpClient>, String), RegistryError> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(namespaced)
            .map(|e| (Arc::clone(&e.client), e.tool.original_name.clone()))
            .ok_or_else(|| RegistryError::Unknown(namespaced.to_string()))
    }

    /// Snapshot of every registered tool, sorted by namespaced name.
    pub fn get_all(&self) -> Vec<RegisteredTool> {
        let mut tools: Vec<_> = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|e| e.tool.clone())
            .collect();
        tools.sort_by(|a, b| a.namespaced_name.cmp(&b.namespaced_name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tools in OpenAI function-calling shape, for the backend request's
    /// `tools` array. A tool without a schema gets the empty-object default.
    pub fn to_openai_schema(&self) -> Vec<Value> {
        self.get_all()
            .into_iter()
            .map(|tool| {
                let parameters = tool
                    .input_schema
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.namespaced_name,
                        "description": tool.description.unwrap_or_default(),
                        "parameters": parameters,
                    }
                })
            })
            .collect()
    }
}
