//! Capability aggregation
//!
//! Builds the synthetic capability surface an inbound session sees: the
//! union of every Connected outbound server passing the session's tag
//! filter, with tool/prompt names and resource URIs mangled into the flat
//! namespace. The aggregated instructions string goes through an external
//! [`TemplateEngine`]; a fixed enumeration is the fallback when rendering
//! fails.

use crate::config::FilterExpression;
use crate::error::{GatewayError, Result};
use crate::mcp::manager::{ConnectionStatus, ExecuteOptions, OutboundManager};
use crate::mcp::naming;
use crate::mcp::types::{
    Prompt, PromptsCapability, ResourceDef, ResourceTemplate, ResourcesCapability,
    ServerCapabilities, Tool, ToolsCapability,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Inputs handed to the instructions template
#[derive(Debug, Clone)]
pub struct InstructionsContext {
    /// Selected servers in provenance order
    pub server_names: Vec<String>,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    /// Per-server instructions strings, provenance order
    pub per_server_instructions: Vec<(String, Option<String>)>,
    /// Opaque per-session options forwarded from the inbound transport
    pub template_config: Option<serde_json::Value>,
}

/// External collaborator rendering the aggregated instructions string
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    async fn render_instructions(&self, context: &InstructionsContext) -> Result<String>;
}

/// The aggregated view served to one inbound session
#[derive(Debug, Clone, Default)]
pub struct AggregatedCapabilities {
    pub tools: Vec<Tool>,
    pub resources: Vec<ResourceDef>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
    /// Capability categories advertised inbound
    pub capabilities: ServerCapabilities,
    pub instructions: String,
    /// Selected Connected servers, provenance order
    pub servers: Vec<String>,
}

/// Merges outbound capabilities into per-session views
pub struct CapabilityAggregator {
    manager: Arc<OutboundManager>,
    template: Option<Arc<dyn TemplateEngine>>,
}

impl CapabilityAggregator {
    pub fn new(manager: Arc<OutboundManager>, template: Option<Arc<dyn TemplateEngine>>) -> Self {
        Self { manager, template }
    }

    /// Names of Connected servers whose tags satisfy the filter, in
    /// deterministic provenance order
    pub async fn selected_servers(&self, filter: &FilterExpression) -> Vec<String> {
        let mut names: Vec<String> = self
            .manager
            .get_all()
            .await
            .into_iter()
            .filter(|(_, connection)| connection.status == ConnectionStatus::Connected)
            .filter(|(_, connection)| filter.matches(&connection.spec.tag_set()))
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    /// Compute the aggregated view for a filter
    pub async fn view(&self, filter: &FilterExpression) -> AggregatedCapabilities {
        self.view_with_config(filter, None).await
    }

    /// Compute the aggregated view, forwarding session template options
    pub async fn view_with_config(
        &self,
        filter: &FilterExpression,
        template_config: Option<serde_json::Value>,
    ) -> AggregatedCapabilities {
        let connections = self.manager.get_all().await;
        let mut selected: Vec<String> = connections
            .iter()
            .filter(|(_, connection)| connection.status == ConnectionStatus::Connected)
            .filter(|(_, connection)| filter.matches(&connection.spec.tag_set()))
            .map(|(name, _)| name.clone())
            .collect();
        selected.sort();

        let mut view = AggregatedCapabilities {
            servers: selected.clone(),
            ..Default::default()
        };
        let mut seen_names: HashSet<String> = HashSet::new();
        let mut per_server_instructions = Vec::new();

        for server in &selected {
            let connection = match connections.get(server) {
                Some(connection) => connection,
                None => continue,
            };
            let capabilities = connection.capabilities.clone().unwrap_or_default();
            per_server_instructions.push((server.clone(), connection.instructions.clone()));

            if capabilities.tools.is_some() {
                view.capabilities.tools = Some(ToolsCapability {
                    list_changed: Some(true),
                });
                match self.fetch_tools(server).await {
                    Ok(tools) => {
                        for mut tool in tools {
                            let mangled = naming::mangle(server, &tool.name);
                            if !seen_names.insert(mangled.clone()) {
                                warn!("Duplicate aggregated tool name '{}'; dropping", mangled);
                                continue;
                            }
                            tool.name = mangled;
                            view.tools.push(tool);
                        }
                    }
                    Err(e) => warn!("tools/list failed for server '{}': {}", server, e),
                }
            }

            if capabilities.resources.is_some() {
                view.capabilities.resources = Some(ResourcesCapability {
                    subscribe: capabilities.resources.as_ref().and_then(|r| r.subscribe),
                    list_changed: Some(true),
                });
                match self.fetch_resources(server).await {
                    Ok(resources) => {
                        for mut resource in resources {
                            let mangled = naming::mangle_uri(server, &resource.uri);
                            if !seen_names.insert(mangled.clone()) {
                                warn!("Duplicate aggregated resource uri '{}'; dropping", mangled);
                                continue;
                            }
                            resource.uri = mangled;
                            view.resources.push(resource);
                        }
                    }
                    Err(e) => debug!("resources/list failed for server '{}': {}", server, e),
                }
                match self.fetch_resource_templates(server).await {
                    Ok(templates) => {
                        for mut template in templates {
                            template.uri_template = naming::mangle_uri(server, &template.uri_template);
                            view.resource_templates.push(template);
                        }
                    }
                    Err(e) => debug!(
                        "resources/templates/list failed for server '{}': {}",
                        server, e
                    ),
                }
            }

            if capabilities.prompts.is_some() {
                view.capabilities.prompts = Some(PromptsCapability {
                    list_changed: Some(true),
                });
                match self.fetch_prompts(server).await {
                    Ok(prompts) => {
                        for mut prompt in prompts {
                            let mangled = naming::mangle(server, &prompt.name);
                            if !seen_names.insert(mangled.clone()) {
                                warn!("Duplicate aggregated prompt name '{}'; dropping", mangled);
                                continue;
                            }
                            prompt.name = mangled;
                            view.prompts.push(prompt);
                        }
                    }
                    Err(e) => warn!("prompts/list failed for server '{}': {}", server, e),
                }
            }

            if capabilities.logging.is_some() {
                view.capabilities.logging = Some(serde_json::json!({}));
            }
            if capabilities.completions.is_some() {
                view.capabilities.completions = Some(serde_json::json!({}));
            }
        }

        let context = InstructionsContext {
            server_names: view.servers.clone(),
            tool_count: view.tools.len(),
            resource_count: view.resources.len(),
            prompt_count: view.prompts.len(),
            per_server_instructions,
            template_config,
        };
        view.instructions = match &self.template {
            Some(engine) => match engine.render_instructions(&context).await {
                Ok(rendered) => rendered,
                Err(e) => {
                    warn!("Instructions template failed ({}); using fallback", e);
                    default_instructions(&context)
                }
            },
            None => default_instructions(&context),
        };

        view
    }

    /// Invert mangling: `mangledName -> (serverName, localName)`
    pub fn resolve(&self, mangled: &str) -> Result<(String, String)> {
        naming::unmangle(mangled)
            .map(|(server, local)| (server.to_string(), local.to_string()))
            .ok_or_else(|| {
                GatewayError::not_found(format!("'{}' is not an aggregated name", mangled))
            })
    }

    /// Invert URI mangling
    pub fn resolve_uri(&self, mangled: &str) -> Result<(String, String)> {
        naming::unmangle_uri(mangled).ok_or_else(|| {
            GatewayError::not_found(format!("'{}' is not an aggregated resource uri", mangled))
        })
    }

    async fn fetch_tools(&self, server: &str) -> Result<Vec<Tool>> {
        self.manager
            .execute(server, ExecuteOptions::default(), |client| {
                Box::pin(async move { client.list_tools().await })
            })
            .await
    }

    async fn fetch_resources(&self, server: &str) -> Result<Vec<ResourceDef>> {
        self.manager
            .execute(server, ExecuteOptions::default(), |client| {
                Box::pin(async move { client.list_resources().await })
            })
            .await
    }

    async fn fetch_resource_templates(&self, server: &str) -> Result<Vec<ResourceTemplate>> {
        self.manager
            .execute(server, ExecuteOptions::default(), |client| {
                Box::pin(async move { client.list_resource_templates().await })
            })
            .await
    }

    async fn fetch_prompts(&self, server: &str) -> Result<Vec<Prompt>> {
        self.manager
            .execute(server, ExecuteOptions::default(), |client| {
                Box::pin(async move { client.list_prompts().await })
            })
            .await
    }
}

/// Fixed fallback: enumerate servers and their instructions in provenance order
fn default_instructions(context: &InstructionsContext) -> String {
    let mut out = format!(
        "This gateway aggregates {} MCP server(s): {}.\n",
        context.server_names.len(),
        context.server_names.join(", ")
    );
    for (server, instructions) in &context.per_server_instructions {
        if let Some(instructions) = instructions {
            if !instructions.is_empty() {
                out.push_str(&format!("\n## {}\n{}\n", server, instructions));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{OAuthRendezvous, SessionStore};
    use crate::mcp::manager::RetryPolicy;
    use crate::mcp::test_support::{fake_server_entry, snapshot_from};
    use std::time::Duration;

    async fn started_manager() -> Arc<OutboundManager> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().to_path_buf()).unwrap());
        std::mem::forget(dir);
        let manager = OutboundManager::new(
            store,
            Arc::new(OAuthRendezvous::new()),
            "http://127.0.0.1:3050".to_string(),
            RetryPolicy {
                initial_delay: Duration::from_millis(50),
                max_attempts: 2,
            },
        );
        let snapshot = snapshot_from(&[
            ("echo", fake_server_entry("echo", "ping", &["web"])),
            ("capability", fake_server_entry("capability", "reflect", &["api", "backend"])),
            ("store", fake_server_entry("store", "put", &["backend"])),
        ]);
        manager.start(&snapshot).await;
        for server in ["echo", "capability", "store"] {
            for _ in 0..200 {
                if let Some(connection) = manager.get(server).await {
                    if connection.status == ConnectionStatus::Connected {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
        manager
    }

    #[tokio::test]
    async fn test_view_aggregates_and_mangles() {
        let manager = started_manager().await;
        let aggregator = CapabilityAggregator::new(Arc::clone(&manager), None);

        let view = aggregator.view(&FilterExpression::All).await;
        let mut names: Vec<&str> = view.tools.iter().map(|t| t.name.as_str()).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["capability_1mcp_reflect", "echo_1mcp_ping", "store_1mcp_put"]
        );
        assert!(view.capabilities.tools.is_some());
        assert!(view.capabilities.prompts.is_none());
        assert!(view.instructions.contains("echo"));
        assert!(view.instructions.contains("instructions from echo"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_view_applies_tag_filter() {
        let manager = started_manager().await;
        let aggregator = CapabilityAggregator::new(Arc::clone(&manager), None);

        let view = aggregator.view(&FilterExpression::any_of(["backend"])).await;
        assert_eq!(view.servers, vec!["capability", "store"]);
        assert_eq!(view.tools.len(), 2);
        assert!(view.tools.iter().all(|t| !t.name.starts_with("echo")));

        // Filter monotonicity under OR: a superset filter yields a superset view
        let wider = aggregator
            .view(&FilterExpression::any_of(["backend", "web"]))
            .await;
        for tool in &view.tools {
            assert!(wider.tools.iter().any(|t| t.name == tool.name));
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_resolve_roundtrip() {
        let manager = started_manager().await;
        let aggregator = CapabilityAggregator::new(Arc::clone(&manager), None);

        let (server, local) = aggregator.resolve("echo_1mcp_ping").unwrap();
        assert_eq!((server.as_str(), local.as_str()), ("echo", "ping"));
        assert!(aggregator.resolve("no-separator").is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_template_failure_falls_back() {
        struct FailingEngine;
        #[async_trait]
        impl TemplateEngine for FailingEngine {
            async fn render_instructions(&self, _: &InstructionsContext) -> Result<String> {
                Err(GatewayError::mcp("template exploded"))
            }
        }

        let manager = started_manager().await;
        let aggregator =
            CapabilityAggregator::new(Arc::clone(&manager), Some(Arc::new(FailingEngine)));
        let view = aggregator.view(&FilterExpression::All).await;
        assert!(view.instructions.contains("aggregates"));
        manager.shutdown().await;
    }
}
