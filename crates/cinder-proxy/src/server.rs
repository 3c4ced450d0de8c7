use std::sync::Arc;

use cinder_core::contract::ToolContract;
use cinder_core::{Dispatcher, Invocation};
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::{
        CallToolRequestParams, CallToolResult, Content, ListToolsResult, PaginatedRequestParams,
        ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
};

/// MCP front end: every `call_tool` becomes one dispatcher invocation.
pub struct CinderServer {
    dispatcher: Arc<Dispatcher>,
}

impl CinderServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    fn tools(&self) -> Vec<Tool> {
        self.dispatcher.catalogue().iter().map(contract_tool).collect()
    }
}

fn contract_tool(contract: &ToolContract) -> Tool {
    let schema = contract.input_schema();
    Tool {
        name: contract.name.into(),
        title: None,
        description: Some(contract.description.into()),
        input_schema: schema.as_object().cloned().unwrap_or_default().into(),
        output_schema: None,
        annotations: None,
        execution: None,
        icons: None,
        meta: None,
    }
}

fn make_tool_result(content: Vec<Content>, is_error: bool) -> CallToolResult {
    CallToolResult {
        content,
        structured_content: None,
        is_error: Some(is_error),
        meta: None,
    }
}

impl ServerHandler for CinderServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation::from_build_env(),
            instructions: Some(
                "Cinder drives a node-graph scene engine. Long operations (start-cook, \
                 start-render, start-inference) return a job id: poll job-status. \
                 Use batch to apply several edits as one unit."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        tracing::debug!("Listing tools");
        Ok(ListToolsResult::with_all_items(self.tools()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let invocation = Invocation::new(
            request.name.to_string(),
            request.arguments.unwrap_or_default(),
        );
        tracing::info!(tool = %invocation.tool, trace_id = %invocation.trace_id, "call_tool");

        let outcome = self.dispatcher.dispatch(&invocation).await;
        let envelope = outcome.to_json(&invocation);
        Ok(make_tool_result(
            vec![Content::text(envelope.to_string())],
            outcome.is_error(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use cinder_core::CinderConfig;
    use cinder_core::engine::SimulatedEngine;

    use super::*;

    fn server() -> CinderServer {
        let dispatcher =
            Dispatcher::new(&CinderConfig::default(), Arc::new(SimulatedEngine::new())).unwrap();
        CinderServer::new(Arc::new(dispatcher))
    }

    #[test]
    fn every_contract_becomes_a_tool() {
        let server = server();
        let tools = server.tools();
        assert_eq!(tools.len(), server.dispatcher.catalogue().len());
        let batch = tools.iter().find(|t| t.name == "batch").unwrap();
        assert_eq!(batch.input_schema["type"], "object");
        assert!(batch.description.is_some());
    }

    #[test]
    fn info_advertises_tools() {
        let info = server().get_info();
        assert!(info.capabilities.tools.is_some());
        assert!(info.instructions.unwrap().contains("job-status"));
    }
}
